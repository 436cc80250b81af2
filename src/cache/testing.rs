//! In-process collaborators for exercising the cache core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::error::{CacheError, Result};
use super::storage::tests::Row;
use super::storage::{CachedEntity, LocalStore, SqliteStorage, StoreChange, WriteMode};
use super::traits::{Cacheable, Joined, QueryKey, RemotePage, RemoteSource};

#[derive(Debug, Clone)]
pub struct TestQuery(String);

impl TestQuery {
  pub fn new(name: &str) -> Self {
    Self(name.to_string())
  }
}

impl QueryKey for TestQuery {
  fn cache_hash(&self) -> String {
    format!("test:{}", self.0)
  }

  fn description(&self) -> String {
    self.0.clone()
  }
}

/// `count` rows named `user-{start}`, `user-{start + 1}`, ...
pub fn numbered(start: usize, count: usize) -> Vec<Row> {
  (start..start + count)
    .map(|i| Row::new(&format!("user-{}", i), &format!("User {}", i)))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDetail {
  pub id: String,
  pub bio: String,
}

impl Cacheable for RowDetail {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    None
  }

  fn entity_type() -> &'static str {
    "row_detail"
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowWithDetail {
  pub id: String,
  pub label: Option<String>,
  pub bio: String,
  pub fetched_at: DateTime<Utc>,
}

impl Joined for RowWithDetail {
  type Summary = Row;
  type Detail = RowDetail;

  fn join(summary: Option<Row>, detail: RowDetail, fetched_at: DateTime<Utc>) -> Self {
    Self {
      id: detail.id,
      label: summary.map(|s| s.label),
      bio: detail.bio,
      fetched_at,
    }
  }
}

/// Scripted remote source. Pages are looked up by token.
#[derive(Default)]
pub struct FakeRemote {
  pages: Mutex<HashMap<Option<String>, RemotePage<Row>>>,
  details: Mutex<HashMap<String, Result<Option<RowDetail>>>>,
  failures: Mutex<VecDeque<CacheError>>,
  tokens: Mutex<Vec<Option<String>>>,
  page_calls: AtomicUsize,
  detail_calls: AtomicUsize,
  gate: Arc<tokio::sync::Mutex<()>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_page(self, token: Option<&str>, records: Vec<Row>, next: Option<&str>) -> Self {
    self.set_page(token, records, next);
    self
  }

  pub fn with_page_and_prev(
    self,
    token: Option<&str>,
    records: Vec<Row>,
    next: Option<&str>,
    prev: Option<&str>,
  ) -> Self {
    self.pages.lock().unwrap().insert(
      token.map(String::from),
      RemotePage {
        records,
        next_token: next.map(String::from),
        prev_token: prev.map(String::from),
      },
    );
    self
  }

  pub fn set_page(&self, token: Option<&str>, records: Vec<Row>, next: Option<&str>) {
    self.pages.lock().unwrap().insert(
      token.map(String::from),
      RemotePage {
        records,
        next_token: next.map(String::from),
        prev_token: None,
      },
    );
  }

  pub fn with_detail(self, key: &str, detail: Result<Option<RowDetail>>) -> Self {
    self.details.lock().unwrap().insert(key.to_string(), detail);
    self
  }

  /// Fail the next page fetch with `error`.
  pub fn fail_next(&self, error: CacheError) {
    self.failures.lock().unwrap().push_back(error);
  }

  /// Block every fetch until the returned guard is dropped.
  pub fn hold(&self) -> tokio::sync::OwnedMutexGuard<()> {
    Arc::clone(&self.gate).try_lock_owned().unwrap()
  }

  pub fn page_calls(&self) -> usize {
    self.page_calls.load(Ordering::SeqCst)
  }

  pub fn detail_calls(&self) -> usize {
    self.detail_calls.load(Ordering::SeqCst)
  }

  pub fn tokens_seen(&self) -> Vec<Option<String>> {
    self.tokens.lock().unwrap().clone()
  }
}

#[async_trait]
impl RemoteSource for FakeRemote {
  type Query = TestQuery;
  type Summary = Row;
  type Detail = RowDetail;

  async fn fetch_page(
    &self,
    _query: &TestQuery,
    token: Option<&str>,
    _page_size: usize,
  ) -> Result<RemotePage<Row>> {
    self.page_calls.fetch_add(1, Ordering::SeqCst);
    self.tokens.lock().unwrap().push(token.map(String::from));
    drop(self.gate.lock().await);

    if let Some(error) = self.failures.lock().unwrap().pop_front() {
      return Err(error);
    }

    self
      .pages
      .lock()
      .unwrap()
      .get(&token.map(String::from))
      .cloned()
      .ok_or_else(|| CacheError::Transport(format!("no page for token {:?}", token)))
  }

  async fn fetch_detail(&self, key: &str) -> Result<Option<RowDetail>> {
    self.detail_calls.fetch_add(1, Ordering::SeqCst);
    drop(self.gate.lock().await);

    self
      .details
      .lock()
      .unwrap()
      .get(key)
      .cloned()
      .unwrap_or_else(|| Err(CacheError::Transport(format!("404 for {}", key))))
  }
}

/// SQLite store whose writes can be made to fail.
pub struct FlakyStore {
  inner: SqliteStorage,
  fail_writes: AtomicBool,
  reads: AtomicUsize,
}

impl FlakyStore {
  pub fn new(inner: SqliteStorage) -> Self {
    Self {
      inner,
      fail_writes: AtomicBool::new(false),
      reads: AtomicUsize::new(0),
    }
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn keyed_reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  fn check_write(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      Err(CacheError::Store("disk full".to_string()))
    } else {
      Ok(())
    }
  }
}

impl LocalStore for FlakyStore {
  fn read_range<T: Cacheable>(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<T>> {
    self.inner.read_range(query, offset, limit)
  }

  fn upsert_page<T: Cacheable>(
    &self,
    query: &str,
    description: &str,
    records: &[T],
    mode: WriteMode,
  ) -> Result<()> {
    self.check_write()?;
    self.inner.upsert_page(query, description, records, mode)
  }

  fn upsert_detail<T: Cacheable>(&self, record: &T) -> Result<()> {
    self.check_write()?;
    self.inner.upsert_detail(record)
  }

  fn read_by_key<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>> {
    self.reads.fetch_add(1, Ordering::SeqCst);
    self.inner.read_by_key(key)
  }

  fn clear_all(&self) -> Result<()> {
    self.check_write()?;
    self.inner.clear_all()
  }

  fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
    self.inner.subscribe()
  }
}
