//! SQLite implementation of the storage backend.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::backend::{entry_size, BackendError, ItemMeta, StorageBackend};

/// SQLite-based key/value storage with a byte quota.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
  quota: u64,
}

/// Schema for the key/value table.
const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    size INTEGER NOT NULL,
    last_accessed TEXT NOT NULL
);
"#;

impl SqliteBackend {
  /// Open or create the storage database at `path`.
  pub fn open(path: &Path, quota: u64) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    Self::with_connection(conn, quota)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory(quota: u64) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory storage: {}", e))?;
    Self::with_connection(conn, quota)
  }

  fn with_connection(conn: Connection, quota: u64) -> Result<Self> {
    conn
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      quota,
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn usage(conn: &Connection) -> Result<u64> {
    let total: i64 = conn
      .query_row("SELECT COALESCE(SUM(size), 0) FROM kv_store", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to compute storage usage: {}", e))?;
    Ok(total.max(0) as u64)
  }
}

fn now_string() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

impl StorageBackend for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;

    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))?;

    if value.is_some() {
      conn
        .execute(
          "UPDATE kv_store SET last_accessed = ? WHERE key = ?",
          params![now_string(), key],
        )
        .map_err(|e| eyre!("Failed to touch key {}: {}", key, e))?;
    }

    Ok(value)
  }

  fn peek(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> std::result::Result<(), BackendError> {
    let conn = self.lock()?;

    let current = Self::usage(&conn)?;
    let replaced: i64 = conn
      .query_row(
        "SELECT size FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read size of {}: {}", key, e))?
      .unwrap_or(0);

    let requested = entry_size(key, value);
    let available = self
      .quota
      .saturating_sub(current.saturating_sub(replaced.max(0) as u64));
    if requested > available {
      return Err(BackendError::QuotaExceeded {
        requested,
        available,
      });
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, size, last_accessed)
         VALUES (?, ?, ?, ?)",
        params![key, value, requested as i64, now_string()],
      )
      .map_err(|e| eyre!("Failed to store key {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove key {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key listing: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn meta(&self, key: &str) -> Result<Option<ItemMeta>> {
    let conn = self.lock()?;
    let row: Option<(i64, String)> = conn
      .query_row(
        "SELECT size, last_accessed FROM kv_store WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read metadata of {}: {}", key, e))?;

    match row {
      Some((size, last_accessed)) => Ok(Some(ItemMeta {
        size: size.max(0) as u64,
        last_accessed: parse_datetime(&last_accessed)?,
      })),
      None => Ok(None),
    }
  }

  fn quota(&self) -> u64 {
    self.quota
  }

  fn estimate(&self) -> Option<u64> {
    let conn = self.lock().ok()?;
    Self::usage(&conn).ok()
  }
}
