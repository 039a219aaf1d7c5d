//! Record and read-result types shared by the query cache and `DataCache`.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};

use crate::remote::Record;

/// A typed record the query cache can hold.
///
/// `from_record` is the only way in: remote records that fail it are dropped
/// before they reach any cache.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Identity used to deduplicate merged pages
  fn cache_key(&self) -> String;

  /// Remote collection holding these records (e.g., "analyses")
  fn entity_type() -> &'static str;

  fn from_record(record: Record) -> Result<Self>;
}

/// Value returned by a named cache read, tagged with its origin.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Fetch time of the cached entry; `None` for network and sample data
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  fn new(data: T, source: CacheSource, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source,
      cached_at,
    }
  }

  pub fn from_network(data: T) -> Self {
    Self::new(data, CacheSource::Network, None)
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    let source = match is_stale {
      true => CacheSource::CacheStale,
      false => CacheSource::CacheFresh,
    };
    Self::new(data, source, Some(cached_at))
  }

  /// Last known value, served because the fetch failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self::new(data, CacheSource::Offline, Some(cached_at))
  }

  /// Sample dataset, served because the fetch failed with nothing cached.
  pub fn fallback(data: T) -> Self {
    Self::new(data, CacheSource::Fallback, None)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched during this read
  Network,
  /// Cached and within the TTL
  CacheFresh,
  /// Cached past the TTL or invalidated; a background refresh was scheduled
  CacheStale,
  /// Fetch failed, last known value
  Offline,
  /// Fetch failed with nothing cached, sample data
  Fallback,
}

impl CacheSource {
  /// Whether the value came from a failed fetch.
  pub fn is_degraded(&self) -> bool {
    matches!(self, CacheSource::Offline | CacheSource::Fallback)
  }
}
