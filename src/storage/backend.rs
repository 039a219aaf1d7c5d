//! Key/value backends the storage manager persists into.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Failure of a backend write.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
  /// The write would push total usage past the quota.
  #[error("storage quota exceeded: {requested} bytes requested, {available} available")]
  QuotaExceeded { requested: u64, available: u64 },
  #[error("storage backend failure: {0}")]
  Other(String),
}

impl From<color_eyre::Report> for BackendError {
  fn from(report: color_eyre::Report) -> Self {
    Self::Other(report.to_string())
  }
}

/// Size and access time of a stored key, read without touching it.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemMeta {
  pub size: u64,
  pub last_accessed: DateTime<Utc>,
}

/// Bytes a key/value pair occupies against the quota.
pub fn entry_size(key: &str, value: &str) -> u64 {
  (key.len() + value.len()) as u64
}

/// Trait for persistent key/value stores with a finite quota.
pub trait StorageBackend: Send + Sync {
  /// Read a value and record the access.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Read a value without recording the access.
  fn peek(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace a value. Fails with `QuotaExceeded` instead of
  /// growing past the quota.
  fn set(&self, key: &str, value: &str) -> std::result::Result<(), BackendError>;

  /// Remove a key. Returns whether it existed.
  fn remove(&self, key: &str) -> Result<bool>;

  /// All stored keys.
  fn keys(&self) -> Result<Vec<String>>;

  fn meta(&self, key: &str) -> Result<Option<ItemMeta>>;

  /// Total bytes available.
  fn quota(&self) -> u64;

  /// Best-effort usage estimate, `None` when the backend cannot tell.
  fn estimate(&self) -> Option<u64>;
}

#[derive(Debug, Clone)]
struct MemoryItem {
  value: String,
  last_accessed: DateTime<Utc>,
}

/// In-process backend, used for ephemeral sessions and tests.
pub struct MemoryBackend {
  items: Mutex<HashMap<String, MemoryItem>>,
  quota: u64,
  supports_estimate: bool,
}

impl MemoryBackend {
  pub fn new(quota: u64) -> Self {
    Self {
      items: Mutex::new(HashMap::new()),
      quota,
      supports_estimate: true,
    }
  }

  /// Disable usage estimation, forcing callers onto their own accounting.
  pub fn without_estimate(mut self) -> Self {
    self.supports_estimate = false;
    self
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryItem>>> {
    self.items.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn usage(items: &HashMap<String, MemoryItem>) -> u64 {
    items.iter().map(|(k, item)| entry_size(k, &item.value)).sum()
  }

  #[cfg(test)]
  pub(crate) fn set_last_accessed(&self, key: &str, at: DateTime<Utc>) {
    if let Some(item) = self.lock().unwrap().get_mut(key) {
      item.last_accessed = at;
    }
  }
}

impl StorageBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let mut items = self.lock()?;
    Ok(items.get_mut(key).map(|item| {
      item.last_accessed = Utc::now();
      item.value.clone()
    }))
  }

  fn peek(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.get(key).map(|item| item.value.clone()))
  }

  fn set(&self, key: &str, value: &str) -> std::result::Result<(), BackendError> {
    let mut items = self.lock()?;

    let current = Self::usage(&items);
    let replaced = items
      .get(key)
      .map(|item| entry_size(key, &item.value))
      .unwrap_or(0);
    let requested = entry_size(key, value);
    let available = self.quota.saturating_sub(current - replaced);
    if requested > available {
      return Err(BackendError::QuotaExceeded {
        requested,
        available,
      });
    }

    items.insert(
      key.to_string(),
      MemoryItem {
        value: value.to_string(),
        last_accessed: Utc::now(),
      },
    );
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.remove(key).is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
    keys.sort();
    Ok(keys)
  }

  fn meta(&self, key: &str) -> Result<Option<ItemMeta>> {
    Ok(self.lock()?.get(key).map(|item| ItemMeta {
      size: entry_size(key, &item.value),
      last_accessed: item.last_accessed,
    }))
  }

  fn quota(&self) -> u64 {
    self.quota
  }

  fn estimate(&self) -> Option<u64> {
    if !self.supports_estimate {
      return None;
    }
    self.lock().ok().map(|items| Self::usage(&items))
  }
}
