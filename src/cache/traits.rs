//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use super::error::{CacheError, Result};

/// Trait for entities that can be cached.
///
/// Implementors must provide a unique cache key and optionally an updated_at timestamp.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g., user login)
  fn cache_key(&self) -> String;

  /// Last modification timestamp reported by the remote (ISO 8601), if any.
  fn updated_at(&self) -> Option<&str>;

  /// Entity type name for storage organization (e.g., "user", "user_detail")
  fn entity_type() -> &'static str;
}

/// Identity of one logical paginated query (e.g. "all users").
pub trait QueryKey: Clone + Send + Sync + 'static {
  /// Stable, fixed-length key used to scope stored pages and page tokens.
  fn cache_hash(&self) -> String;

  /// Human readable description, stored alongside the query.
  fn description(&self) -> String;
}

/// A read model assembled from a stored detail record and the summary cached
/// under the same identity.
pub trait Joined: Send + 'static {
  type Summary: Cacheable;
  type Detail: Cacheable;

  fn join(summary: Option<Self::Summary>, detail: Self::Detail, fetched_at: DateTime<Utc>) -> Self;
}

/// Direction of a load signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadDirection {
  Refresh,
  Prepend,
  Append,
}

impl LoadDirection {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Refresh => "refresh",
      Self::Prepend => "prepend",
      Self::Append => "append",
    }
  }
}

/// Outcome of one remote mediator load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult {
  /// Records were fetched and persisted.
  Success { more_data_available: bool },
  /// The fetch or the write failed; nothing was persisted.
  Failure(CacheError),
  /// No fetch was issued (end reached, refresh pending, or a duplicate request).
  Skipped,
}

/// One page returned by a remote source.
#[derive(Debug, Clone)]
pub struct RemotePage<T> {
  pub records: Vec<T>,
  /// Cursor for the page after this one; `None` at the end of the listing.
  pub next_token: Option<String>,
  /// Cursor for the page before this one, when the source paginates backwards.
  pub prev_token: Option<String>,
}

/// Paginated and keyed network access for one kind of record.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
  type Query: QueryKey;
  type Summary: Cacheable;
  type Detail: Cacheable;

  /// Fetch a page of summaries. A `None` token requests the first page.
  async fn fetch_page(
    &self,
    query: &Self::Query,
    token: Option<&str>,
    page_size: usize,
  ) -> Result<RemotePage<Self::Summary>>;

  /// Fetch a single detail record. `Ok(None)` means the remote had nothing for `key`.
  async fn fetch_detail(&self, key: &str) -> Result<Option<Self::Detail>>;
}
