mod cache;
mod commands;
mod config;
mod github;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ghusers")]
#[command(about = "Browse GitHub users through an offline-first local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ghusers/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log debug output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List users, page by page
  Users {
    /// GitHub user search expression (e.g. "location:berlin")
    #[arg(short, long)]
    search: Option<String>,

    /// Number of pages to load
    #[arg(short, long, default_value_t = 1)]
    pages: usize,
  },
  /// Show a user's profile
  User {
    login: String,

    /// Print the cached profile without contacting GitHub
    #[arg(long)]
    offline: bool,
  },
  /// Delete all locally cached users
  ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose, &logging::log_dir())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let repo = github::UsersRepository::new(&config)?;

  match args.command {
    Command::Users { search, pages } => commands::users(&repo, search.as_deref(), pages).await,
    Command::User { login, offline } => commands::user(&repo, &login, offline).await,
    Command::ClearCache => commands::clear_cache(&repo).await,
  }
}
