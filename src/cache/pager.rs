//! Pagination engine: a restartable stream of page windows for one query.
//!
//! Each [`Pager`] owns a driver task while it has subscribers. The driver
//! reads windows through the [`LocalPageProvider`], forwards load signals the
//! store cannot satisfy to the [`RemoteMediator`], and re-reads the window on
//! every store change that touches its query. Consumers see the latest window
//! through a watch channel, so a slow consumer only ever skips to the newest
//! window; it never sees a half-applied one.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::mediator::RemoteMediator;
use super::page_source::{LocalPageProvider, RemoteEnds};
use super::storage::{LocalStore, StoreChange, WriteMode};
use super::traits::{LoadDirection, LoadResult, QueryKey, RemoteSource};

/// Paging knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingConfig {
  /// Rows fetched per remote page and added per consumer load signal.
  pub page_size: usize,
  /// Rows shown after the stream starts or restarts.
  pub initial_load_size: usize,
  /// How long an unobserved pager keeps its state before releasing it.
  pub retention: Duration,
}

impl PagingConfig {
  pub fn new(page_size: usize) -> Self {
    Self {
      page_size,
      initial_load_size: page_size * 3,
      retention: Duration::from_millis(5000),
    }
  }
}

impl Default for PagingConfig {
  fn default() -> Self {
    Self::new(20)
  }
}

/// Progress of loads in one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
  NotLoading { end_of_pagination_reached: bool },
  Loading,
  Error(CacheError),
}

impl LoadState {
  fn idle() -> Self {
    Self::NotLoading {
      end_of_pagination_reached: false,
    }
  }
}

/// Load state per direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStates {
  pub refresh: LoadState,
  pub prepend: LoadState,
  pub append: LoadState,
}

impl LoadStates {
  pub fn get(&self, direction: LoadDirection) -> &LoadState {
    match direction {
      LoadDirection::Refresh => &self.refresh,
      LoadDirection::Prepend => &self.prepend,
      LoadDirection::Append => &self.append,
    }
  }

  fn set(&mut self, direction: LoadDirection, state: LoadState) {
    match direction {
      LoadDirection::Refresh => self.refresh = state,
      LoadDirection::Prepend => self.prepend = state,
      LoadDirection::Append => self.append = state,
    }
  }
}

impl Default for LoadStates {
  fn default() -> Self {
    Self {
      refresh: LoadState::idle(),
      prepend: LoadState::idle(),
      append: LoadState::idle(),
    }
  }
}

/// The slice of a query's rows currently materialized for consumers.
#[derive(Debug, Clone)]
pub struct PageWindow<T> {
  pub items: Vec<T>,
  /// Increments whenever the sequence restarts from the first page.
  pub generation: u64,
  pub load_states: LoadStates,
  pub reached_start: bool,
  pub reached_end: bool,
}

impl<T> PageWindow<T> {
  fn loading() -> Self {
    Self {
      items: Vec::new(),
      generation: 0,
      load_states: LoadStates {
        refresh: LoadState::Loading,
        ..LoadStates::default()
      },
      reached_start: false,
      reached_end: false,
    }
  }
}

type Windows<T> = Arc<watch::Sender<PageWindow<T>>>;

struct Running<T> {
  windows: Windows<T>,
  requests: mpsc::UnboundedSender<LoadDirection>,
  task: JoinHandle<()>,
}

struct Shared<S: LocalStore, R: RemoteSource> {
  query: R::Query,
  query_hash: String,
  config: PagingConfig,
  store: Arc<S>,
  mediator: Arc<RemoteMediator<S, R>>,
  running: Mutex<Option<Running<R::Summary>>>,
  /// Number of `observe` calls, used to notice re-subscriptions while idle.
  subscriptions: AtomicU64,
}

impl<S: LocalStore, R: RemoteSource> Shared<S, R> {
  fn running(&self) -> MutexGuard<'_, Option<Running<R::Summary>>> {
    self.running.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Restartable stream of page windows for one query.
pub struct Pager<S: LocalStore, R: RemoteSource> {
  shared: Arc<Shared<S, R>>,
}

impl<S: LocalStore, R: RemoteSource> Pager<S, R> {
  pub fn new(
    query: R::Query,
    store: Arc<S>,
    mediator: Arc<RemoteMediator<S, R>>,
    config: PagingConfig,
  ) -> Self {
    let query_hash = query.cache_hash();
    Self {
      shared: Arc::new(Shared {
        query,
        query_hash,
        config,
        store,
        mediator,
        running: Mutex::new(None),
        subscriptions: AtomicU64::new(0),
      }),
    }
  }

  /// Subscribe to the window sequence, starting the driver if it is not running.
  ///
  /// The first item is the current window. A restarted driver begins with
  /// the cached rows and an initial refresh.
  pub fn observe(&self) -> BoxStream<'static, PageWindow<R::Summary>> {
    let mut running = self.shared.running();
    self.shared.subscriptions.fetch_add(1, Ordering::SeqCst);

    if let Some(current) = running.as_ref() {
      if !current.task.is_finished() {
        return window_stream(current.windows.subscribe());
      }
    }

    let (tx, rx) = watch::channel(PageWindow::loading());
    let windows = Arc::new(tx);
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    // Subscribe before the first read so no change can slip in between.
    let changes = self.shared.store.subscribe();

    let driver = Driver::new(
      Arc::clone(&self.shared),
      Arc::clone(&windows),
      requests_rx,
      changes,
    );
    let task = tokio::spawn(driver.run());
    info!(query = %self.shared.query.description(), "pager started");

    *running = Some(Running {
      windows,
      requests: requests_tx,
      task,
    });
    window_stream(rx)
  }

  /// Signal a load in `direction`. Returns false when nothing is observing.
  pub fn request_load(&self, direction: LoadDirection) -> bool {
    match self.shared.running().as_ref() {
      Some(current) => current.requests.send(direction).is_ok(),
      None => false,
    }
  }

  /// Whether a driver currently holds state for this query.
  #[cfg(test)]
  pub fn is_active(&self) -> bool {
    self
      .shared
      .running()
      .as_ref()
      .map(|r| !r.task.is_finished())
      .unwrap_or(false)
  }
}

fn window_stream<T>(rx: watch::Receiver<PageWindow<T>>) -> BoxStream<'static, PageWindow<T>>
where
  T: Clone + Send + Sync + 'static,
{
  stream::unfold((rx, true), |(mut rx, first)| async move {
    if !first && rx.changed().await.is_err() {
      return None;
    }
    let window = rx.borrow_and_update().clone();
    Some((window, (rx, false)))
  })
  .boxed()
}

/// Whether `change` discards the rows a window was built from.
fn restarts_window(change: &StoreChange) -> bool {
  match change {
    StoreChange::Query { mode, .. } => *mode == WriteMode::Replace,
    StoreChange::Entity { .. } => false,
    StoreChange::Cleared => true,
  }
}

/// Owns the consumer-facing state of a running pager.
struct Driver<S: LocalStore, R: RemoteSource> {
  shared: Arc<Shared<S, R>>,
  windows: Windows<R::Summary>,
  requests: mpsc::UnboundedReceiver<LoadDirection>,
  changes: broadcast::Receiver<StoreChange>,
  completions_tx: mpsc::UnboundedSender<(LoadDirection, LoadResult)>,
  completions: mpsc::UnboundedReceiver<(LoadDirection, LoadResult)>,
  provider: LocalPageProvider<S>,
  loads: HashMap<LoadDirection, JoinHandle<()>>,
  load_states: LoadStates,
  /// Rows the window should show.
  target: usize,
  /// Whether the store held rows past the last published window.
  more_stored: bool,
}

impl<S: LocalStore, R: RemoteSource> Driver<S, R> {
  fn new(
    shared: Arc<Shared<S, R>>,
    windows: Windows<R::Summary>,
    requests: mpsc::UnboundedReceiver<LoadDirection>,
    changes: broadcast::Receiver<StoreChange>,
  ) -> Self {
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let provider = LocalPageProvider::new(Arc::clone(&shared.store), shared.query_hash.clone());
    let target = shared.config.initial_load_size;
    Self {
      shared,
      windows,
      requests,
      changes,
      completions_tx,
      completions,
      provider,
      loads: HashMap::new(),
      load_states: LoadStates::default(),
      target,
      more_stored: false,
    }
  }

  async fn run(mut self) {
    self.launch(LoadDirection::Refresh);
    self.publish_window().await;

    let mut idle: Option<(Instant, u64)> = None;
    loop {
      let deadline = idle.map(|(at, _)| at).unwrap_or_else(Instant::now);

      tokio::select! {
        Some(direction) = self.requests.recv() => self.on_request(direction).await,
        Some((direction, result)) = self.completions.recv() => {
          self.on_loaded(direction, result).await
        }
        change = self.changes.recv() => match change {
          Ok(change) if change.affects_query(&self.shared.query_hash) => {
            self.on_store_change(&change).await
          }
          Ok(_) => {}
          Err(RecvError::Lagged(skipped)) => {
            debug!(skipped, "missed store changes");
            self.on_store_change(&StoreChange::Cleared).await
          }
          Err(RecvError::Closed) => break,
        },
        _ = self.windows.closed(), if idle.is_none() => {
          debug!(query = %self.shared.query.description(), "no subscribers");
          let seen = self.shared.subscriptions.load(Ordering::SeqCst);
          idle = Some((Instant::now() + self.shared.config.retention, seen));
        }
        _ = tokio::time::sleep_until(deadline), if idle.is_some() => {
          let seen = idle.map(|(_, seen)| seen).unwrap_or_default();
          if self.try_release(seen) {
            break;
          }
          idle = None;
        }
      }
    }

    for (_, load) in self.loads.drain() {
      load.abort();
    }
    info!(query = %self.shared.query.description(), "pager released");
  }

  /// Drop the running state unless someone subscribed during the idle period.
  fn try_release(&self, seen: u64) -> bool {
    let mut running = self.shared.running();
    if self.windows.receiver_count() > 0
      || self.shared.subscriptions.load(Ordering::SeqCst) != seen
    {
      return false;
    }
    *running = None;
    true
  }

  fn remote_ends(&self) -> RemoteEnds {
    let mediator = &self.shared.mediator;
    RemoteEnds {
      start: mediator.end_reached(&self.shared.query_hash, LoadDirection::Prepend),
      end: mediator.end_reached(&self.shared.query_hash, LoadDirection::Append),
    }
  }

  async fn on_request(&mut self, direction: LoadDirection) {
    match direction {
      LoadDirection::Refresh => self.launch(direction),
      LoadDirection::Append if self.more_stored => {
        // Already stored, no need to go remote
        self.target += self.shared.config.page_size;
        self.publish_window().await;
      }
      LoadDirection::Append | LoadDirection::Prepend => {
        let ends = self.remote_ends();
        let end_reached = match direction {
          LoadDirection::Append => ends.end,
          _ => ends.start,
        };
        if end_reached {
          self.load_states.set(
            direction,
            LoadState::NotLoading {
              end_of_pagination_reached: true,
            },
          );
          self.publish_states();
        } else {
          self.launch(direction);
        }
      }
    }
  }

  fn launch(&mut self, direction: LoadDirection) {
    if let Some(load) = self.loads.get(&direction) {
      if !load.is_finished() {
        return;
      }
    }

    self.load_states.set(direction, LoadState::Loading);
    self.publish_states();

    let mediator = Arc::clone(&self.shared.mediator);
    let query = self.shared.query.clone();
    let done = self.completions_tx.clone();
    let load = tokio::spawn(async move {
      let result = mediator.load(&query, direction).await;
      let _ = done.send((direction, result));
    });
    self.loads.insert(direction, load);
  }

  async fn on_loaded(&mut self, direction: LoadDirection, result: LoadResult) {
    self.absorb_pending_changes();
    let ends = self.remote_ends();
    match result {
      LoadResult::Success {
        more_data_available,
      } => {
        match direction {
          LoadDirection::Refresh => {
            self.load_states.append = LoadState::NotLoading {
              end_of_pagination_reached: ends.end,
            };
            self.load_states.prepend = LoadState::NotLoading {
              end_of_pagination_reached: ends.start,
            };
            self.load_states.refresh = LoadState::idle();
          }
          LoadDirection::Append | LoadDirection::Prepend => {
            self.target += self.shared.config.page_size;
            self.load_states.set(
              direction,
              LoadState::NotLoading {
                end_of_pagination_reached: !more_data_available,
              },
            );
          }
        }
      }
      LoadResult::Failure(e) => {
        warn!(query = %self.shared.query.description(), direction = direction.as_str(), error = %e, "load failed");
        self.load_states.set(direction, LoadState::Error(e));
      }
      LoadResult::Skipped => {
        let end_of_pagination_reached = match direction {
          LoadDirection::Refresh => false,
          LoadDirection::Append => ends.end,
          LoadDirection::Prepend => ends.start,
        };
        self.load_states.set(
          direction,
          LoadState::NotLoading {
            end_of_pagination_reached,
          },
        );
      }
    }
    self.publish_window().await;
  }

  async fn on_store_change(&mut self, change: &StoreChange) {
    if restarts_window(change) {
      self.restart();
    }
    self.publish_window().await;
  }

  /// Apply the changes a finished load already broadcast. The store notifies
  /// before the load completes, so the window published for the completion
  /// carries the write and its invalidation together.
  fn absorb_pending_changes(&mut self) {
    let mut restart = false;
    loop {
      match self.changes.try_recv() {
        Ok(change) => {
          restart |= change.affects_query(&self.shared.query_hash) && restarts_window(&change);
        }
        Err(TryRecvError::Lagged(_)) => restart = true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
      }
    }
    if restart {
      self.restart();
    }
  }

  fn restart(&mut self) {
    let generation = self.provider.invalidate();
    self.target = self.shared.config.initial_load_size;
    debug!(query = %self.shared.query.description(), generation, "window invalidated");
  }

  fn publish_states(&self) {
    let states = self.load_states.clone();
    self.windows.send_modify(|window| window.load_states = states);
  }

  async fn publish_window(&mut self) {
    let ends = self.remote_ends();
    match self.provider.load(None, self.target, ends).await {
      Ok(page) => {
        self.more_stored = page.more_stored;
        self.windows.send_replace(PageWindow {
          items: page.items,
          generation: page.generation,
          load_states: self.load_states.clone(),
          reached_start: page.reached_start,
          reached_end: page.reached_end,
        });
      }
      Err(e) => {
        // Keep the last good window visible and surface the failure.
        warn!(query = %self.shared.query.description(), error = %e, "window read failed");
        self.load_states.refresh = LoadState::Error(e);
        self.publish_states();
      }
    }
  }
}
