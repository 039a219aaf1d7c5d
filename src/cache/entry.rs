//! Named cache entries and the per-session cache state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::records::{Analytics, HistoryItem, UserStats};

/// The named caches held by [`DataCache`](super::DataCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheName {
  History,
  Analytics,
  UserStats,
  Recents,
}

impl CacheName {
  pub const ALL: [CacheName; 4] = [
    CacheName::History,
    CacheName::Analytics,
    CacheName::UserStats,
    CacheName::Recents,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      CacheName::History => "history",
      CacheName::Analytics => "analytics",
      CacheName::UserStats => "user_stats",
      CacheName::Recents => "recents",
    }
  }
}

impl fmt::Display for CacheName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Cached value with the time it was fetched.
///
/// `is_valid` is cleared by invalidation without dropping `data`; staleness by
/// age is derived on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  pub timestamp: DateTime<Utc>,
  pub is_valid: bool,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T) -> Self {
    Self {
      data,
      timestamp: Utc::now(),
      is_valid: true,
    }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    (now - self.timestamp).to_std().unwrap_or_default()
  }

  pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
    !self.is_valid || self.age(now) >= ttl
  }
}

/// One entry slot per cache name. This is what gets persisted per user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheState {
  #[serde(default)]
  pub history: Option<CacheEntry<Vec<HistoryItem>>>,
  #[serde(default)]
  pub analytics: Option<CacheEntry<Analytics>>,
  #[serde(default)]
  pub user_stats: Option<CacheEntry<UserStats>>,
  #[serde(default)]
  pub recents: Option<CacheEntry<Vec<HistoryItem>>>,
}

impl CacheState {
  /// Timestamp and validity of the entry under `name`, if any.
  pub fn entry_meta(&self, name: CacheName) -> Option<(DateTime<Utc>, bool)> {
    match name {
      CacheName::History => self.history.as_ref().map(|e| (e.timestamp, e.is_valid)),
      CacheName::Analytics => self.analytics.as_ref().map(|e| (e.timestamp, e.is_valid)),
      CacheName::UserStats => self.user_stats.as_ref().map(|e| (e.timestamp, e.is_valid)),
      CacheName::Recents => self.recents.as_ref().map(|e| (e.timestamp, e.is_valid)),
    }
  }

  /// Mark the entry under `name` invalid. Returns whether an entry existed.
  pub fn invalidate(&mut self, name: CacheName) -> bool {
    fn clear<T>(entry: &mut Option<CacheEntry<T>>) -> bool {
      match entry {
        Some(entry) => {
          entry.is_valid = false;
          true
        }
        None => false,
      }
    }

    match name {
      CacheName::History => clear(&mut self.history),
      CacheName::Analytics => clear(&mut self.analytics),
      CacheName::UserStats => clear(&mut self.user_stats),
      CacheName::Recents => clear(&mut self.recents),
    }
  }

  /// Copy of the state with image payloads removed from the record lists.
  pub fn without_images(&self) -> CacheState {
    let mut state = self.clone();
    for entry in [state.history.as_mut(), state.recents.as_mut()]
      .into_iter()
      .flatten()
    {
      for item in entry.data.iter_mut() {
        item.image = None;
      }
    }
    state
  }

  /// Names whose entry is missing or stale at `now`.
  pub fn needs_refresh(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<CacheName> {
    CacheName::ALL
      .into_iter()
      .filter(|name| match self.entry_meta(*name) {
        Some((timestamp, is_valid)) => {
          !is_valid || (now - timestamp).to_std().unwrap_or_default() >= ttl
        }
        None => true,
      })
      .collect()
  }
}

/// Loading flag and last error of one named cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotStatus {
  pub loading: bool,
  pub error: Option<String>,
}

/// Status of every named cache, published through a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatus {
  slots: BTreeMap<CacheName, SlotStatus>,
}

impl CacheStatus {
  pub fn get(&self, name: CacheName) -> SlotStatus {
    self.slots.get(&name).cloned().unwrap_or_default()
  }

  pub fn is_loading(&self, name: CacheName) -> bool {
    self.slots.get(&name).map(|s| s.loading).unwrap_or(false)
  }

  pub fn error(&self, name: CacheName) -> Option<&str> {
    self.slots.get(&name).and_then(|s| s.error.as_deref())
  }

  pub(crate) fn set_loading(&mut self, name: CacheName, loading: bool) {
    self.slots.entry(name).or_default().loading = loading;
  }

  pub(crate) fn set_error(&mut self, name: CacheName, error: Option<String>) {
    self.slots.entry(name).or_default().error = error;
  }
}
