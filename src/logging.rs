//! Tracing setup: a daily rotated log file, mirrored to stderr when verbose.

use color_eyre::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default filter when RUST_LOG is unset.
fn default_directive(verbose: bool) -> &'static str {
  if verbose {
    "ghusers=debug"
  } else {
    "ghusers=info"
  }
}

/// `$XDG_DATA_HOME/ghusers/logs`, falling back to the current directory.
pub fn log_dir() -> PathBuf {
  dirs::data_dir()
    .map(|d| d.join("ghusers").join("logs"))
    .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Install the global subscriber. Keep the guard alive until exit so the
/// file writer flushes.
pub fn init(verbose: bool, dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)?;

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

  let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "ghusers.log"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false)))
    .try_init()?;

  Ok(guard)
}
