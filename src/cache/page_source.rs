//! Local page provider: windows over the rows stored for a query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::error::Result;
use super::storage::{run_blocking, LocalStore};
use super::traits::Cacheable;

/// A contiguous slice of a query's stored rows.
#[derive(Debug, Clone)]
pub struct LocalPage<T> {
  pub items: Vec<T>,
  /// Snapshot generation the page was read under.
  pub generation: u64,
  /// Whether stored rows exist past the end of this page.
  pub more_stored: bool,
  /// Nothing before this page, locally or remotely.
  pub reached_start: bool,
  /// Nothing after this page, locally or remotely.
  pub reached_end: bool,
}

/// Whether the remote has run out of pages in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteEnds {
  pub start: bool,
  pub end: bool,
}

/// Reads windows of one query from the local store. Never touches the network.
pub struct LocalPageProvider<S: LocalStore> {
  store: Arc<S>,
  query: String,
  generation: AtomicU64,
}

impl<S: LocalStore> LocalPageProvider<S> {
  pub fn new(store: Arc<S>, query_hash: impl Into<String>) -> Self {
    Self {
      store,
      query: query_hash.into(),
      generation: AtomicU64::new(0),
    }
  }

  /// Start a new snapshot. Returns the new generation.
  pub fn invalidate(&self) -> u64 {
    self.generation.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  /// Read up to `page_size` rows centered on `anchor`, or from the first row
  /// when there is no anchor.
  pub async fn load<T: Cacheable>(
    &self,
    anchor: Option<usize>,
    page_size: usize,
    remote: RemoteEnds,
  ) -> Result<LocalPage<T>> {
    let generation = self.generation();
    let offset = anchor
      .map(|a| a.saturating_sub(page_size / 2))
      .unwrap_or(0);
    let query = self.query.clone();

    // One extra row tells whether the store can extend this page.
    let mut items: Vec<T> = run_blocking(&self.store, move |s| {
      s.read_range(&query, offset, page_size + 1)
    })
    .await?;

    let more_stored = items.len() > page_size;
    items.truncate(page_size);

    Ok(LocalPage {
      items,
      generation,
      more_stored,
      reached_start: offset == 0 && remote.start,
      reached_end: !more_stored && remote.end,
    })
  }
}
