//! Users repository: GitHub users served through the offline-first cache.

use color_eyre::Result;
use futures::stream::{BoxStream, StreamExt};
use tracing::info;

use crate::cache::{self, CacheLayer, CachedEntity, LoadDirection, PageWindow, SqliteStorage};
use crate::config::Config;

use super::cache::{login_key, UsersQuery};
use super::client::GithubClient;
use super::types::{User, UserWithDetail};

/// Entry point for user listings and profiles.
///
/// Lists page through the local store and grow from GitHub on demand;
/// profiles are always fetched, stored, then read back from the store.
pub struct UsersRepository {
  cache: CacheLayer<SqliteStorage, GithubClient>,
}

impl UsersRepository {
  pub fn new(config: &Config) -> Result<Self> {
    let client = GithubClient::new(config)?;
    let path = config.cache_path()?;
    let storage = SqliteStorage::open(&path)?;
    info!(path = %path.display(), "cache opened");

    Ok(Self::with_parts(
      storage,
      client,
      config.paging.to_paging_config(),
    ))
  }

  pub fn with_parts(storage: SqliteStorage, client: GithubClient, paging: cache::PagingConfig) -> Self {
    Self {
      cache: CacheLayer::new(storage, client, paging),
    }
  }

  /// Windows of users for `query`, newest state first.
  pub fn users(&self, query: &UsersQuery) -> BoxStream<'static, PageWindow<User>> {
    self.cache.observe(query)
  }

  /// Ask for more users for an observed `query`.
  pub fn request_load(&self, query: &UsersQuery, direction: LoadDirection) -> bool {
    self.cache.request_load(query, direction)
  }

  /// Reload `query` from its first page.
  pub fn refresh(&self, query: &UsersQuery) -> bool {
    self.cache.refresh(query)
  }

  /// Fetch the profile of `login`; the stream yields exactly one result.
  pub fn user_detail(&self, login: &str) -> BoxStream<'static, cache::Result<UserWithDetail>> {
    self.cache.observe_detail(login)
  }

  /// Fetch the profile of `login` and wait for the stored copy.
  pub async fn get_user_detail(&self, login: &str) -> cache::Result<UserWithDetail> {
    self
      .user_detail(login)
      .next()
      .await
      .unwrap_or_else(|| Err(cache::CacheError::EmptyPayload(format!("no result for {}", login))))
  }

  /// The stored profile of `login`, if one was ever fetched.
  pub async fn cached_user_detail(&self, login: &str) -> cache::Result<Option<CachedEntity<UserWithDetail>>> {
    self.cache.cached_detail(&login_key(login)).await
  }

  /// Drop everything cached locally.
  pub async fn clear_cache(&self) -> cache::Result<()> {
    self.cache.clear().await
  }
}
