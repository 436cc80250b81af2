//! Local store trait and SQLite implementation.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::error::{CacheError, Result};
use super::traits::Cacheable;

/// Capacity of the change notification channel. Slow receivers that lag
/// behind see `RecvError::Lagged` and treat it as a full invalidation.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached entity
  pub entity: T,
  /// When the entity was written to the store
  pub cached_at: DateTime<Utc>,
}

impl<T> CachedEntity<T> {
  /// Whether the entity is older than `max_age`.
  ///
  /// Nothing in the pipeline acts on this; callers can use it to decide
  /// whether a cached value is worth showing without a refetch.
  pub fn is_stale(&self, max_age: Duration) -> bool {
    Utc::now() - self.cached_at > max_age
  }
}

/// How a page write relates to the rows already stored for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
  /// Drop the query's rows and store the page as its only content.
  Replace,
  /// Place new identities after the last stored row.
  Append,
  /// Place new identities before the first stored row.
  Prepend,
}

/// Notification sent after a write has been committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
  /// Rows of a paginated query changed.
  Query { query: String, mode: WriteMode },
  /// A keyed record was upserted.
  Entity { key: String },
  /// Every table was cleared.
  Cleared,
}

impl StoreChange {
  /// Whether the change can alter the rows visible for `query`.
  pub fn affects_query(&self, query: &str) -> bool {
    match self {
      Self::Query { query: q, .. } => q == query,
      Self::Entity { .. } => false,
      Self::Cleared => true,
    }
  }
}

/// Trait for local store backends.
///
/// Every method is blocking. Async code runs them through [`run_blocking`].
pub trait LocalStore: Send + Sync + 'static {
  /// Read up to `limit` rows of a query, ordered by position, skipping `offset`.
  fn read_range<T: Cacheable>(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<T>>;

  /// Write a page of records for a query in a single transaction.
  fn upsert_page<T: Cacheable>(
    &self,
    query: &str,
    description: &str,
    records: &[T],
    mode: WriteMode,
  ) -> Result<()>;

  /// Insert or replace a keyed record.
  fn upsert_detail<T: Cacheable>(&self, record: &T) -> Result<()>;

  /// Get a single record by key.
  fn read_by_key<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>>;

  /// Remove everything from the store.
  fn clear_all(&self) -> Result<()>;

  /// Subscribe to change notifications.
  fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// Run a store operation on the blocking pool.
pub async fn run_blocking<S, F, T>(store: &Arc<S>, op: F) -> Result<T>
where
  S: LocalStore,
  F: FnOnce(&S) -> Result<T> + Send + 'static,
  T: Send + 'static,
{
  let store = Arc::clone(store);
  tokio::task::spawn_blocking(move || op(&store)).await?
}

/// SQLite-based store implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  changes: broadcast::Sender<StoreChange>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::store(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::store(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
    let storage = Self {
      conn: Mutex::new(conn),
      changes,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CacheError::store(format!("Failed to run cache migrations: {}", e)))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::store(format!("Lock poisoned: {}", e)))
  }

  fn notify(&self, change: StoreChange) {
    // No receivers is fine; nobody is observing.
    let _ = self.changes.send(change);
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Generic entity cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
);

-- Paginated query tracking
CREATE TABLE IF NOT EXISTS query_cache (
    query_hash TEXT PRIMARY KEY,
    query_description TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    result_count INTEGER NOT NULL
);

-- Query to entity mapping; position is the sort key
CREATE TABLE IF NOT EXISTS query_results (
    query_hash TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (query_hash, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_query_results_position
    ON query_results(query_hash, position);
"#;

fn put_entity<T: Cacheable>(tx: &Transaction<'_>, entity: &T, cached_at: &str) -> Result<()> {
  let data = serde_json::to_vec(entity)?;
  tx.execute(
    "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, updated_at, cached_at)
     VALUES (?, ?, ?, ?, ?)",
    params![
      T::entity_type(),
      entity.cache_key(),
      data,
      entity.updated_at(),
      cached_at
    ],
  )?;
  Ok(())
}

impl LocalStore for SqliteStorage {
  fn read_range<T: Cacheable>(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<T>> {
    let conn = self.lock()?;

    let mut stmt = conn.prepare(
      "SELECT ec.data FROM query_results qr
       INNER JOIN entity_cache ec ON ec.entity_type = ?1 AND ec.entity_key = qr.entity_key
       WHERE qr.query_hash = ?2
       ORDER BY qr.position
       LIMIT ?3 OFFSET ?4",
    )?;

    let rows = stmt.query_map(
      params![T::entity_type(), query, limit as i64, offset as i64],
      |row| row.get::<_, Vec<u8>>(0),
    )?;

    let mut entities: Vec<T> = Vec::new();
    for data in rows {
      entities.push(serde_json::from_slice(&data?)?);
    }
    Ok(entities)
  }

  fn upsert_page<T: Cacheable>(
    &self,
    query: &str,
    description: &str,
    records: &[T],
    mode: WriteMode,
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let entity_type = T::entity_type();
    let now = Utc::now().to_rfc3339();

    // Dropped without commit on any early return, which rolls back.
    let tx = conn.transaction()?;

    // First position to hand out, and the step between new rows.
    let first_position: i64 = match mode {
      WriteMode::Replace => {
        tx.execute(
          "DELETE FROM query_results WHERE query_hash = ?",
          params![query],
        )?;
        0
      }
      WriteMode::Append => tx.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM query_results WHERE query_hash = ?",
        params![query],
        |row| row.get(0),
      )?,
      WriteMode::Prepend => {
        let min: i64 = tx.query_row(
          "SELECT COALESCE(MIN(position), 0) FROM query_results WHERE query_hash = ?",
          params![query],
          |row| row.get(0),
        )?;
        min - records.len() as i64
      }
    };

    let mut position = first_position;
    for record in records {
      put_entity(&tx, record, &now)?;

      // Identities already in this query keep their place.
      let inserted = tx.execute(
        "INSERT INTO query_results (query_hash, entity_key, position) VALUES (?, ?, ?)
         ON CONFLICT(query_hash, entity_key) DO NOTHING",
        params![query, record.cache_key(), position],
      )?;
      if inserted > 0 {
        position += 1;
      }
    }

    if mode == WriteMode::Replace {
      // Summaries no query refers to anymore
      tx.execute(
        "DELETE FROM entity_cache WHERE entity_type = ?
         AND entity_key NOT IN (SELECT entity_key FROM query_results)",
        params![entity_type],
      )?;
    }

    tx.execute(
      "INSERT OR REPLACE INTO query_cache (query_hash, query_description, entity_type, cached_at, result_count)
       VALUES (?, ?, ?, ?, (SELECT COUNT(*) FROM query_results WHERE query_hash = ?))",
      params![query, description, entity_type, now, query],
    )?;

    tx.commit()?;
    drop(conn);

    self.notify(StoreChange::Query {
      query: query.to_string(),
      mode,
    });
    Ok(())
  }

  fn upsert_detail<T: Cacheable>(&self, record: &T) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    put_entity(&tx, record, &Utc::now().to_rfc3339())?;
    tx.commit()?;
    drop(conn);

    self.notify(StoreChange::Entity {
      key: record.cache_key(),
    });
    Ok(())
  }

  fn read_by_key<T: Cacheable>(&self, key: &str) -> Result<Option<CachedEntity<T>>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ?",
        params![T::entity_type(), key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((data, cached_at)) => Ok(Some(CachedEntity {
        entity: serde_json::from_slice(&data)?,
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn clear_all(&self) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute_batch(
      "DELETE FROM query_results;
       DELETE FROM query_cache;
       DELETE FROM entity_cache;",
    )?;
    tx.commit()?;
    drop(conn);

    self.notify(StoreChange::Cleared);
    Ok(())
  }

  fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
    self.changes.subscribe()
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| CacheError::store(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  pub struct Row {
    pub id: String,
    pub label: String,
  }

  impl Row {
    pub fn new(id: &str, label: &str) -> Self {
      Self {
        id: id.to_string(),
        label: label.to_string(),
      }
    }
  }

  impl Cacheable for Row {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn updated_at(&self) -> Option<&str> {
      None
    }

    fn entity_type() -> &'static str {
      "row"
    }
  }

  pub fn rows(ids: &[&str]) -> Vec<Row> {
    ids.iter().map(|id| Row::new(id, id)).collect()
  }

  fn ids(rows: &[Row]) -> Vec<&str> {
    rows.iter().map(|r| r.id.as_str()).collect()
  }

  #[test]
  fn test_replace_then_read_in_order() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store
      .upsert_page("q", "q", &rows(&["a", "b", "c"]), WriteMode::Replace)
      .unwrap();

    let read: Vec<Row> = store.read_range("q", 0, 10).unwrap();
    assert_eq!(ids(&read), vec!["a", "b", "c"]);

    let tail: Vec<Row> = store.read_range("q", 1, 1).unwrap();
    assert_eq!(ids(&tail), vec!["b"]);
  }

  #[test]
  fn test_replace_drops_previous_rows() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store
      .upsert_page("q", "q", &rows(&["a", "b"]), WriteMode::Replace)
      .unwrap();
    store
      .upsert_page("q", "q", &rows(&["c"]), WriteMode::Replace)
      .unwrap();

    let read: Vec<Row> = store.read_range("q", 0, 10).unwrap();
    assert_eq!(ids(&read), vec!["c"]);
    assert!(store.read_by_key::<Row>("a").unwrap().is_none());
  }

  #[test]
  fn test_replace_keeps_rows_of_other_queries() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store
      .upsert_page("q1", "q1", &rows(&["a", "b"]), WriteMode::Replace)
      .unwrap();
    store
      .upsert_page("q2", "q2", &rows(&["a"]), WriteMode::Replace)
      .unwrap();
    store
      .upsert_page("q1", "q1", &rows(&["z"]), WriteMode::Replace)
      .unwrap();

    let q2: Vec<Row> = store.read_range("q2", 0, 10).unwrap();
    assert_eq!(ids(&q2), vec!["a"]);
    assert!(store.read_by_key::<Row>("b").unwrap().is_none());
  }

  #[test]
  fn test_append_and_prepend_positions() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store
      .upsert_page("q", "q", &rows(&["c", "d"]), WriteMode::Replace)
      .unwrap();
    store
      .upsert_page("q", "q", &rows(&["e", "f"]), WriteMode::Append)
      .unwrap();
    store
      .upsert_page("q", "q", &rows(&["a", "b"]), WriteMode::Prepend)
      .unwrap();

    let read: Vec<Row> = store.read_range("q", 0, 10).unwrap();
    assert_eq!(ids(&read), vec!["a", "b", "c", "d", "e", "f"]);
  }

  #[test]
  fn test_append_never_duplicates_identity() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store
      .upsert_page("q", "q", &rows(&["a", "b"]), WriteMode::Replace)
      .unwrap();
    store
      .upsert_page(
        "q",
        "q",
        &[Row::new("b", "updated"), Row::new("c", "c")],
        WriteMode::Append,
      )
      .unwrap();

    let read: Vec<Row> = store.read_range("q", 0, 10).unwrap();
    assert_eq!(ids(&read), vec!["a", "b", "c"]);
    // Data is still refreshed in place
    assert_eq!(read[1].label, "updated");
  }

  /// Stored as a `Row`, but fails to serialize when `broken` is set.
  #[derive(Debug, Clone, Deserialize)]
  struct Brittle {
    id: String,
    label: String,
    #[serde(skip)]
    broken: bool,
  }

  impl Brittle {
    fn new(id: &str, label: &str, broken: bool) -> Self {
      Self {
        id: id.to_string(),
        label: label.to_string(),
        broken,
      }
    }
  }

  impl Serialize for Brittle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
      if self.broken {
        return Err(serde::ser::Error::custom("unserializable record"));
      }
      Row::new(&self.id, &self.label).serialize(serializer)
    }
  }

  impl Cacheable for Brittle {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn updated_at(&self) -> Option<&str> {
      None
    }

    fn entity_type() -> &'static str {
      "row"
    }
  }

  #[test]
  fn test_failed_record_rolls_back_whole_page() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store
      .upsert_page("q", "q", &rows(&["a"]), WriteMode::Replace)
      .unwrap();
    let mut changes = store.subscribe();

    let page = vec![
      Brittle::new("a", "rewritten", false),
      Brittle::new("b", "b", false),
      Brittle::new("c", "c", true),
    ];
    for mode in [WriteMode::Append, WriteMode::Prepend, WriteMode::Replace] {
      let err = store.upsert_page("q", "q", &page, mode).unwrap_err();
      assert!(matches!(err, CacheError::Store(_)), "{:?}: {:?}", mode, err);
    }

    let read: Vec<Row> = store.read_range("q", 0, 10).unwrap();
    assert_eq!(read, vec![Row::new("a", "a")]);
    assert!(store.read_by_key::<Row>("b").unwrap().is_none());
    assert!(changes.try_recv().is_err());
  }

  #[test]
  fn test_detail_round_trip() {
    let store = SqliteStorage::open_in_memory().unwrap();
    assert!(store.read_by_key::<Row>("x").unwrap().is_none());

    store.upsert_detail(&Row::new("x", "first")).unwrap();
    store.upsert_detail(&Row::new("x", "second")).unwrap();

    let cached = store.read_by_key::<Row>("x").unwrap().unwrap();
    assert_eq!(cached.entity, Row::new("x", "second"));
    assert!(!cached.is_stale(Duration::minutes(5)));
  }

  #[test]
  fn test_clear_all() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store
      .upsert_page("q", "q", &rows(&["a"]), WriteMode::Replace)
      .unwrap();
    store.upsert_detail(&Row::new("x", "x")).unwrap();

    store.clear_all().unwrap();

    assert!(store.read_range::<Row>("q", 0, 10).unwrap().is_empty());
    assert!(store.read_by_key::<Row>("x").unwrap().is_none());
  }

  #[test]
  fn test_changes_are_sent_after_commit() {
    let store = SqliteStorage::open_in_memory().unwrap();
    let mut changes = store.subscribe();

    store
      .upsert_page("q", "q", &rows(&["a"]), WriteMode::Append)
      .unwrap();
    store.upsert_detail(&Row::new("x", "x")).unwrap();
    store.clear_all().unwrap();

    let first = changes.try_recv().unwrap();
    assert_eq!(
      first,
      StoreChange::Query {
        query: "q".to_string(),
        mode: WriteMode::Append
      }
    );
    assert!(first.affects_query("q"));
    assert!(!first.affects_query("other"));

    let second = changes.try_recv().unwrap();
    assert_eq!(
      second,
      StoreChange::Entity {
        key: "x".to_string()
      }
    );
    assert!(!second.affects_query("q"));

    assert!(changes.try_recv().unwrap().affects_query("anything"));
  }

  #[tokio::test]
  async fn test_run_blocking() {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    run_blocking(&store, |s| {
      s.upsert_page("q", "q", &rows(&["a", "b"]), WriteMode::Replace)
    })
    .await
    .unwrap();

    let read: Vec<Row> = run_blocking(&store, |s| s.read_range("q", 0, 10))
      .await
      .unwrap();
    assert_eq!(ids(&read), vec!["a", "b"]);
  }
}
