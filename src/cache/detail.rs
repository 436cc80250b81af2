//! Detail sync: fetch one record, persist it, and emit what the store holds.

use futures::future::FutureExt;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::error::{CacheError, Result};
use super::storage::{run_blocking, CachedEntity, LocalStore};
use super::traits::{Cacheable, Joined, RemoteSource};

/// Number of identity lock stripes.
const LOCK_STRIPES: usize = 16;

/// Fetch-then-persist-then-reread pipeline for single records.
///
/// The emitted value is always read back from the store after the write, so
/// it is exactly what other readers of the same identity can see.
pub struct DetailSync<S: LocalStore, R: RemoteSource> {
  store: Arc<S>,
  remote: Arc<R>,
  /// Serializes write-and-reread per identity.
  locks: Arc<[Mutex<()>; LOCK_STRIPES]>,
}

impl<S: LocalStore, R: RemoteSource> Clone for DetailSync<S, R> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      remote: Arc::clone(&self.remote),
      locks: Arc::clone(&self.locks),
    }
  }
}

impl<S: LocalStore, R: RemoteSource> DetailSync<S, R> {
  pub fn new(store: Arc<S>, remote: Arc<R>) -> Self {
    Self {
      store,
      remote,
      locks: Arc::new(std::array::from_fn(|_| Mutex::new(()))),
    }
  }

  /// Stream with exactly one item: the stored record for `key`, or the
  /// failure that prevented storing it. Each call starts a new request.
  pub fn fetch_detail<J>(&self, key: &str) -> BoxStream<'static, Result<J>>
  where
    J: Joined<Summary = R::Summary, Detail = R::Detail>,
  {
    let this = self.clone();
    let key = key.to_string();

    stream::once(async move {
      AssertUnwindSafe(this.sync::<J>(&key))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(CacheError::Transport(format!("request for {} panicked", key))))
    })
    .boxed()
  }

  async fn sync<J>(&self, key: &str) -> Result<J>
  where
    J: Joined<Summary = R::Summary, Detail = R::Detail>,
  {
    debug!(key, "fetching detail");
    let detail = match self.remote.fetch_detail(key).await {
      Ok(Some(detail)) => detail,
      Ok(None) => {
        warn!(key, "remote returned no detail");
        return Err(CacheError::EmptyPayload(format!("no detail returned for {}", key)));
      }
      Err(e) => {
        warn!(key, error = %e, "detail fetch failed");
        return Err(e);
      }
    };

    let identity = detail.cache_key();
    let locks = Arc::clone(&self.locks);
    let stripe = stripe_for(&identity);

    let joined = run_blocking(&self.store, move |store| {
      let _guard = locks[stripe].lock().unwrap_or_else(|e| e.into_inner());

      store.upsert_detail(&detail)?;

      read_joined::<S, J>(store, &identity)?
        .map(|cached| cached.entity)
        .ok_or_else(|| CacheError::store(format!("{} missing right after write", identity)))
    })
    .await;

    if let Err(e) = &joined {
      warn!(key, error = %e, "detail persist failed");
    }
    joined
  }

  /// The stored detail for `key`, without going remote.
  pub async fn cached<J>(&self, key: &str) -> Result<Option<CachedEntity<J>>>
  where
    J: Joined<Summary = R::Summary, Detail = R::Detail>,
  {
    let locks = Arc::clone(&self.locks);
    let key = key.to_string();
    run_blocking(&self.store, move |store| {
      let _guard = locks[stripe_for(&key)].lock().unwrap_or_else(|e| e.into_inner());
      read_joined::<S, J>(store, &key)
    })
    .await
  }
}

/// Join the stored detail for `identity` with the summary stored under the
/// same identity. `cached_at` is the detail's.
fn read_joined<S: LocalStore, J: Joined>(store: &S, identity: &str) -> Result<Option<CachedEntity<J>>> {
  let Some(stored) = store.read_by_key::<J::Detail>(identity)? else {
    return Ok(None);
  };
  let summary = store
    .read_by_key::<J::Summary>(identity)?
    .map(|cached| cached.entity);

  Ok(Some(CachedEntity {
    entity: J::join(summary, stored.entity, stored.cached_at),
    cached_at: stored.cached_at,
  }))
}

fn stripe_for(identity: &str) -> usize {
  let mut hasher = DefaultHasher::new();
  identity.hash(&mut hasher);
  (hasher.finish() as usize) % LOCK_STRIPES
}
