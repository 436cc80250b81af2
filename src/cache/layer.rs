//! Cache layer that orchestrates pagers, the mediator and detail sync.

use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::detail::DetailSync;
use super::error::Result;
use super::mediator::RemoteMediator;
use super::pager::{PageWindow, Pager, PagingConfig};
use super::storage::{run_blocking, CachedEntity, LocalStore};
use super::traits::{Joined, LoadDirection, QueryKey, RemoteSource};

/// Cache layer that manages paginated queries and single-record lookups.
///
/// This layer sits between the application and the network client,
/// serving everything from the local store and going remote only when the
/// store cannot answer.
pub struct CacheLayer<S: LocalStore, R: RemoteSource> {
  store: Arc<S>,
  mediator: Arc<RemoteMediator<S, R>>,
  detail: DetailSync<S, R>,
  config: PagingConfig,
  /// One pager per query hash.
  pagers: Mutex<HashMap<String, Arc<Pager<S, R>>>>,
}

impl<S: LocalStore, R: RemoteSource> CacheLayer<S, R> {
  /// Create a new cache layer over the given store and remote.
  pub fn new(store: S, remote: R, config: PagingConfig) -> Self {
    let store = Arc::new(store);
    let remote = Arc::new(remote);
    Self {
      mediator: Arc::new(RemoteMediator::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        config.page_size,
      )),
      detail: DetailSync::new(Arc::clone(&store), remote),
      store,
      config,
      pagers: Mutex::new(HashMap::new()),
    }
  }

  fn pager(&self, query: &R::Query) -> Arc<Pager<S, R>> {
    let mut pagers = self.pagers.lock().unwrap_or_else(|e| e.into_inner());
    let pager = pagers.entry(query.cache_hash()).or_insert_with(|| {
      Arc::new(Pager::new(
        query.clone(),
        Arc::clone(&self.store),
        Arc::clone(&self.mediator),
        self.config,
      ))
    });
    Arc::clone(pager)
  }

  /// Lazy, restartable sequence of page windows for `query`.
  pub fn observe(&self, query: &R::Query) -> BoxStream<'static, PageWindow<R::Summary>> {
    self.pager(query).observe()
  }

  /// Ask the pager of `query` to load more in `direction`.
  ///
  /// Returns false when `query` is not being observed.
  pub fn request_load(&self, query: &R::Query, direction: LoadDirection) -> bool {
    self.pager(query).request_load(direction)
  }

  /// Restart `query` from its first remote page.
  pub fn refresh(&self, query: &R::Query) -> bool {
    self.request_load(query, LoadDirection::Refresh)
  }

  /// Single-item stream with the stored detail for `key`, or the failure.
  pub fn observe_detail<J>(&self, key: &str) -> BoxStream<'static, Result<J>>
  where
    J: Joined<Summary = R::Summary, Detail = R::Detail>,
  {
    self.detail.fetch_detail(key)
  }

  /// The stored detail for `key`, without going remote.
  pub async fn cached_detail<J>(&self, key: &str) -> Result<Option<CachedEntity<J>>>
  where
    J: Joined<Summary = R::Summary, Detail = R::Detail>,
  {
    self.detail.cached(key).await
  }

  /// Drop every cached record and page token.
  ///
  /// Tokens go first: a load that commits after this point belongs to an
  /// older generation and is discarded instead of landing in the empty store.
  pub async fn clear(&self) -> Result<()> {
    self.mediator.forget_all();
    run_blocking(&self.store, |s| s.clear_all()).await
  }
}
