use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::PagingConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub github: GithubConfig,
  #[serde(default)]
  pub paging: PagingSettings,
  #[serde(default)]
  pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
  /// Base URL of the REST API (GitHub Enterprise: `https://host/api/v3`)
  #[serde(default = "default_api_url")]
  pub api_url: String,
  #[serde(default = "default_user_agent")]
  pub user_agent: String,
}

impl Default for GithubConfig {
  fn default() -> Self {
    Self {
      api_url: default_api_url(),
      user_agent: default_user_agent(),
    }
  }
}

fn default_api_url() -> String {
  "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
  "ghusers".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagingSettings {
  #[serde(default = "default_page_size")]
  pub page_size: usize,
  /// Rows shown on first load (defaults to three pages)
  pub initial_load_size: Option<usize>,
  #[serde(default = "default_retention_ms")]
  pub retention_ms: u64,
}

impl Default for PagingSettings {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
      initial_load_size: None,
      retention_ms: default_retention_ms(),
    }
  }
}

fn default_page_size() -> usize {
  20
}

fn default_retention_ms() -> u64 {
  5000
}

impl PagingSettings {
  pub fn to_paging_config(&self) -> PagingConfig {
    let defaults = PagingConfig::new(self.page_size);
    PagingConfig {
      initial_load_size: self.initial_load_size.unwrap_or(defaults.initial_load_size),
      retention: Duration::from_millis(self.retention_ms),
      ..defaults
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettings {
  /// SQLite database file (default: $XDG_DATA_HOME/ghusers/cache.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ghusers.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ghusers/config.yaml
  ///
  /// Without a file every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ghusers.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ghusers").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  fn validate(&self) -> Result<()> {
    if self.paging.page_size == 0 {
      return Err(eyre!("paging.page_size must be greater than zero"));
    }
    if self.paging.initial_load_size == Some(0) {
      return Err(eyre!("paging.initial_load_size must be greater than zero"));
    }
    url::Url::parse(&self.github.api_url)
      .map_err(|e| eyre!("Invalid github.api_url {}: {}", self.github.api_url, e))?;
    Ok(())
  }

  /// Location of the SQLite cache.
  pub fn cache_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache.path {
      return Ok(path.clone());
    }
    let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("ghusers").join("cache.db"))
  }

  /// Get the GitHub API token from environment variables.
  ///
  /// Checks GHUSERS_GITHUB_TOKEN first, then GITHUB_TOKEN as fallback.
  /// Without a token requests are anonymous and rate limited harder.
  pub fn get_api_token() -> Option<String> {
    std::env::var("GHUSERS_GITHUB_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
