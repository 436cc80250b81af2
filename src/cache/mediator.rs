//! Remote mediator: turns load signals into remote fetches and store writes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::error::Result;
use super::storage::{LocalStore, WriteMode};
use super::traits::{LoadDirection, LoadResult, QueryKey, RemoteSource};

/// Page token for one direction of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
  /// Nothing fetched yet, so there is no page to continue from.
  Unset,
  /// Token returned by the most recent successful fetch.
  At(String),
  /// The remote reported no further page.
  End,
}

impl Cursor {
  fn from_token(token: Option<String>) -> Self {
    token.map(Cursor::At).unwrap_or(Cursor::End)
  }
}

/// Pagination state of one query. Only the mediator touches it.
#[derive(Debug)]
struct QueryState {
  next: Cursor,
  prev: Cursor,
  /// Bumped when a refresh starts. Loads that began under an older
  /// generation are discarded at commit time.
  generation: u64,
  refreshing: bool,
  in_flight: HashSet<LoadDirection>,
}

impl Default for QueryState {
  fn default() -> Self {
    Self {
      next: Cursor::Unset,
      prev: Cursor::Unset,
      generation: 0,
      refreshing: false,
      in_flight: HashSet::new(),
    }
  }
}

type SharedState = Arc<Mutex<QueryState>>;

fn lock(state: &Mutex<QueryState>) -> MutexGuard<'_, QueryState> {
  // The state is plain data and every update is a single assignment.
  state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Releases a direction's in-flight claim, also when the load is cancelled.
struct InFlight {
  state: SharedState,
  direction: LoadDirection,
}

impl Drop for InFlight {
  fn drop(&mut self) {
    let mut st = lock(&self.state);
    st.in_flight.remove(&self.direction);
    if self.direction == LoadDirection::Refresh {
      st.refreshing = false;
    }
  }
}

/// Fetches remote pages on demand and persists them into the local store.
///
/// The mediator is the only writer of paginated data. Each query gets its own
/// cursor state; a store write and the cursor update that goes with it happen
/// under that query's lock, on the blocking pool, so dropping a load future
/// can never leave the two out of step.
pub struct RemoteMediator<S: LocalStore, R: RemoteSource> {
  store: Arc<S>,
  remote: Arc<R>,
  page_size: usize,
  queries: Mutex<HashMap<String, SharedState>>,
}

impl<S: LocalStore, R: RemoteSource> RemoteMediator<S, R> {
  pub fn new(store: Arc<S>, remote: Arc<R>, page_size: usize) -> Self {
    Self {
      store,
      remote,
      page_size,
      queries: Mutex::new(HashMap::new()),
    }
  }

  fn state_for(&self, query_hash: &str) -> SharedState {
    let mut queries = self.queries.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(queries.entry(query_hash.to_string()).or_default())
  }

  /// Whether the remote has reported the end of the listing in `direction`.
  ///
  /// Always false for `Refresh`, and false before the first successful fetch.
  pub fn end_reached(&self, query_hash: &str, direction: LoadDirection) -> bool {
    let state = self.state_for(query_hash);
    let st = lock(&state);
    match direction {
      LoadDirection::Refresh => false,
      LoadDirection::Append => st.next == Cursor::End,
      LoadDirection::Prepend => st.prev == Cursor::End,
    }
  }

  /// Forget every cursor, e.g. after the store was cleared.
  ///
  /// Loads in flight are bound to the old generation and will be discarded.
  pub fn forget_all(&self) {
    let queries = self.queries.lock().unwrap_or_else(|e| e.into_inner());
    for state in queries.values() {
      let mut st = lock(state);
      st.next = Cursor::Unset;
      st.prev = Cursor::Unset;
      st.generation += 1;
    }
  }

  #[cfg(test)]
  pub(crate) fn remote(&self) -> &Arc<R> {
    &self.remote
  }

  /// Run one load for `query` in `direction`.
  pub async fn load(&self, query: &R::Query, direction: LoadDirection) -> LoadResult {
    let query_hash = query.cache_hash();
    let description = query.description();
    let state = self.state_for(&query_hash);

    let (generation, token) = {
      let mut st = lock(&state);

      if st.in_flight.contains(&direction) {
        debug!(query = %description, direction = direction.as_str(), "load already in flight");
        return LoadResult::Skipped;
      }

      let token = match direction {
        LoadDirection::Refresh => {
          // The old cursors stay in place but are unusable until this
          // refresh either commits new ones or gives up.
          st.generation += 1;
          st.refreshing = true;
          None
        }
        LoadDirection::Append | LoadDirection::Prepend => {
          if st.refreshing {
            debug!(query = %description, direction = direction.as_str(), "refresh pending");
            return LoadResult::Skipped;
          }
          let cursor = if direction == LoadDirection::Append {
            &st.next
          } else {
            &st.prev
          };
          match cursor {
            Cursor::At(token) => Some(token.clone()),
            Cursor::Unset | Cursor::End => {
              debug!(query = %description, direction = direction.as_str(), cursor = ?cursor, "nothing to load");
              return LoadResult::Skipped;
            }
          }
        }
      };

      st.in_flight.insert(direction);
      (st.generation, token)
    };
    let _claim = InFlight {
      state: Arc::clone(&state),
      direction,
    };

    debug!(query = %description, direction = direction.as_str(), "fetching page");
    let page = match self
      .remote
      .fetch_page(query, token.as_deref(), self.page_size)
      .await
    {
      Ok(page) => page,
      Err(e) => {
        warn!(query = %description, direction = direction.as_str(), error = %e, "page fetch failed");
        return LoadResult::Failure(e);
      }
    };

    let fetched = page.records.len();
    let store = Arc::clone(&self.store);
    let commit_state = Arc::clone(&state);
    let commit = tokio::task::spawn_blocking(move || -> Result<Option<bool>> {
      let mut st = lock(&commit_state);
      if st.generation != generation {
        return Ok(None);
      }

      let mode = match direction {
        LoadDirection::Refresh => WriteMode::Replace,
        LoadDirection::Append => WriteMode::Append,
        LoadDirection::Prepend => WriteMode::Prepend,
      };
      store.upsert_page(&query_hash, &description, &page.records, mode)?;

      let more = match direction {
        LoadDirection::Refresh => {
          st.prev = Cursor::from_token(page.prev_token);
          st.next = Cursor::from_token(page.next_token);
          st.next != Cursor::End
        }
        LoadDirection::Append => {
          st.next = Cursor::from_token(page.next_token);
          st.next != Cursor::End
        }
        LoadDirection::Prepend => {
          st.prev = Cursor::from_token(page.prev_token);
          st.prev != Cursor::End
        }
      };
      Ok(Some(more))
    })
    .await;

    match commit {
      Ok(Ok(Some(more_data_available))) => {
        info!(
          query = %query.description(),
          direction = direction.as_str(),
          fetched,
          more_data_available,
          "page stored"
        );
        LoadResult::Success {
          more_data_available,
        }
      }
      Ok(Ok(None)) => {
        debug!(query = %query.description(), direction = direction.as_str(), "superseded by refresh");
        LoadResult::Skipped
      }
      Ok(Err(e)) => {
        warn!(query = %query.description(), direction = direction.as_str(), error = %e, "page write failed");
        LoadResult::Failure(e)
      }
      Err(e) => LoadResult::Failure(e.into()),
    }
  }
}
