//! Error taxonomy for the caching core.

use thiserror::Error;

/// Failure raised by a remote fetch or a local store operation.
///
/// Errors are carried by value (inside load results and page windows), so the
/// payloads are plain messages and the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// Network or remote failure, including unparseable responses.
  #[error("transport error: {0}")]
  Transport(String),
  /// The remote call succeeded but returned nothing usable.
  #[error("empty payload: {0}")]
  EmptyPayload(String),
  /// Local persistence failure.
  #[error("store error: {0}")]
  Store(String),
}

impl CacheError {
  pub fn transport(msg: impl std::fmt::Display) -> Self {
    Self::Transport(msg.to_string())
  }

  pub fn store(msg: impl std::fmt::Display) -> Self {
    Self::Store(msg.to_string())
  }
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Store(e.to_string())
  }
}

// Only stored records go through serde_json on this path; wire parsing maps
// its own errors to `Transport` at the client.
impl From<serde_json::Error> for CacheError {
  fn from(e: serde_json::Error) -> Self {
    Self::Store(format!("failed to (de)serialize record: {}", e))
  }
}

impl From<tokio::task::JoinError> for CacheError {
  fn from(e: tokio::task::JoinError) -> Self {
    Self::Store(format!("store task did not complete: {}", e))
  }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
