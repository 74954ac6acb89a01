//! Key-value store backends: in-memory and SQLite.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::error::{StoreError, StoreResult};
use super::traits::KeyValueStore;

/// Ordered in-memory store. Enumeration follows key order.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, BTreeMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> StoreResult<Option<String>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> StoreResult<()> {
    self.lock()?.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> StoreResult<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn len(&self) -> StoreResult<usize> {
    Ok(self.lock()?.len())
  }

  fn key(&self, index: usize) -> StoreResult<Option<String>> {
    Ok(self.lock()?.keys().nth(index).cloned())
  }
}

/// Memory store whose writes start failing after a set number succeed.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct FlakyStore {
  inner: MemoryStore,
  writes: std::sync::atomic::AtomicUsize,
  fail_from: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FlakyStore {
  pub(crate) fn new() -> Self {
    Self {
      inner: MemoryStore::new(),
      writes: std::sync::atomic::AtomicUsize::new(0),
      fail_from: std::sync::atomic::AtomicUsize::new(usize::MAX),
    }
  }

  /// Let `allowed` more writes through, then fail every later one.
  pub(crate) fn fail_after(&self, allowed: usize) {
    use std::sync::atomic::Ordering;
    let from = self.writes.load(Ordering::SeqCst).saturating_add(allowed);
    self.fail_from.store(from, Ordering::SeqCst);
  }

  fn check_write(&self) -> StoreResult<()> {
    use std::sync::atomic::Ordering;
    let n = self.writes.fetch_add(1, Ordering::SeqCst);
    if n >= self.fail_from.load(Ordering::SeqCst) {
      return Err(StoreError::Backend("injected write failure".into()));
    }
    Ok(())
  }
}

#[cfg(test)]
impl KeyValueStore for FlakyStore {
  fn get(&self, key: &str) -> StoreResult<Option<String>> {
    self.inner.get(key)
  }

  fn set(&self, key: &str, value: &str) -> StoreResult<()> {
    self.check_write()?;
    self.inner.set(key, value)
  }

  fn remove(&self, key: &str) -> StoreResult<()> {
    self.check_write()?;
    self.inner.remove(key)
  }

  fn len(&self) -> StoreResult<usize> {
    self.inner.len()
  }

  fn key(&self, index: usize) -> StoreResult<Option<String>> {
    self.inner.key(index)
  }
}

/// SQLite-backed store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the store table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open the store at `path`, creating parent directories as needed.
  pub fn open(path: &Path) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    Self::from_connection(Connection::open(path)?)
  }

  /// Open the store at the default location.
  pub fn open_default() -> StoreResult<Self> {
    Self::open(&Self::default_path()?)
  }

  pub fn open_in_memory() -> StoreResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> StoreResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StoreError::NoDataDir)?;

    Ok(data_dir.join("querycache").join("cache.db"))
  }

  fn from_connection(conn: Connection) -> StoreResult<Self> {
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }

  /// When `key` was last written.
  pub fn updated_at(&self, key: &str) -> StoreResult<Option<DateTime<Utc>>> {
    let conn = self.lock()?;
    let raw: Option<String> = conn
      .query_row(
        "SELECT updated_at FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    raw.map(|s| parse_datetime(&s)).transpose()
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> StoreResult<Option<String>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn len(&self) -> StoreResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
  }

  fn key(&self, index: usize) -> StoreResult<Option<String>> {
    let conn = self.lock()?;
    let offset = i64::try_from(index).unwrap_or(i64::MAX);
    let key = conn
      .query_row(
        "SELECT key FROM kv_store ORDER BY key LIMIT 1 OFFSET ?",
        params![offset],
        |row| row.get(0),
      )
      .optional()?;
    Ok(key)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> StoreResult<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StoreError::Backend(Box::new(e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(store: &dyn KeyValueStore) {
    assert!(store.is_empty().unwrap());

    store.set("b", "2").unwrap();
    store.set("a", "1").unwrap();
    store.set("b", "3").unwrap();

    assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    assert_eq!(store.get("b").unwrap().as_deref(), Some("3"));
    assert_eq!(store.get("c").unwrap(), None);
    assert_eq!(store.len().unwrap(), 2);
    assert_eq!(store.key(0).unwrap().as_deref(), Some("a"));
    assert_eq!(store.key(1).unwrap().as_deref(), Some("b"));
    assert_eq!(store.key(2).unwrap(), None);

    store.remove("a").unwrap();
    store.remove("missing").unwrap();
    assert_eq!(store.get("a").unwrap(), None);
    assert_eq!(store.len().unwrap(), 1);
  }

  #[test]
  fn test_memory_store() {
    exercise(&MemoryStore::new());
  }

  #[test]
  fn test_flaky_store_fails_after_allowed_writes() {
    let store = FlakyStore::new();
    exercise(&store);

    store.fail_after(1);
    store.set("a", "1").unwrap();
    assert!(matches!(store.set("b", "2"), Err(StoreError::Backend(_))));
    assert!(store.remove("a").is_err());
    assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    assert_eq!(store.get("b").unwrap(), None);
  }

  #[test]
  fn test_sqlite_store_in_memory() {
    exercise(&SqliteStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_store_persists_across_opens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.set("todo-sets", "[]").unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get("todo-sets").unwrap().as_deref(), Some("[]"));
    assert!(store.updated_at("todo-sets").unwrap().is_some());
    assert_eq!(store.updated_at("missing").unwrap(), None);
  }

  #[test]
  fn test_parse_datetime() {
    let parsed = parse_datetime("2024-03-01 12:30:00").unwrap();
    assert_eq!(parsed.to_rfc3339(), "2024-03-01T12:30:00+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }
}
