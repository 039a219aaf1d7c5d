//! Quota-aware persistence with compression and size/recency eviction.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{BackendError, StorageBackend};
use super::codec::{Codec, KeyTokenCodec};
use crate::config::StorageConfig;

/// Marks a stored envelope. Serialized JSON never starts with `~`, so a
/// plain value can not be mistaken for an envelope whatever its shape.
const ENVELOPE_TAG: &str = "~z~";

/// Wrapper for values that went through the codec.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  compressed: bool,
  codec: String,
  data: String,
}

fn is_envelope(raw: &str) -> bool {
  raw.starts_with(ENVELOPE_TAG)
}

/// Aggregate usage of the storage namespace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageStats {
  pub used: u64,
  pub available: u64,
  pub quota: u64,
  /// Usage as a percentage of the quota (0-100).
  pub percentage: f64,
}

/// Transient view of one stored key. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageItem {
  pub key: String,
  pub size: u64,
  pub last_accessed: DateTime<Utc>,
  pub compressed: bool,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
  pub evicted: Vec<String>,
  pub freed: u64,
}

/// Owns the storage namespace: every read and write of persisted cache data
/// goes through here.
pub struct StorageManager {
  backend: Arc<dyn StorageBackend>,
  codec: Arc<dyn Codec>,
  config: StorageConfig,
}

impl StorageManager {
  pub fn new(backend: Arc<dyn StorageBackend>, config: StorageConfig) -> Self {
    Self {
      backend,
      codec: Arc::new(KeyTokenCodec),
      config,
    }
  }

  /// Replace the compression codec.
  pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
    self.codec = codec;
    self
  }

  pub fn config(&self) -> &StorageConfig {
    &self.config
  }

  // ==========================================================================
  // Write path
  // ==========================================================================

  /// Persist `value` under `key`.
  ///
  /// Returns `false` when the value is too large or the quota cannot be
  /// satisfied even after one cleanup; never errors.
  pub fn set_item_safely<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
    match serde_json::to_string(value) {
      Ok(raw) => self.write_raw(key, raw),
      Err(e) => {
        warn!(key, error = %e, "Failed to serialize value, write skipped");
        false
      }
    }
  }

  fn write_raw(&self, key: &str, raw: String) -> bool {
    let stored = if raw.len() > self.config.compression_threshold {
      match self.encode(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
          warn!(key, error = %e, "Compression failed, storing uncompressed");
          raw
        }
      }
    } else {
      raw
    };

    if stored.len() > self.config.max_item_size {
      warn!(
        key,
        size = stored.len(),
        limit = self.config.max_item_size,
        "Value exceeds per-item limit, write rejected"
      );
      return false;
    }

    match self.backend.set(key, &stored) {
      Ok(()) => {}
      Err(BackendError::QuotaExceeded {
        requested,
        available,
      }) => {
        warn!(key, requested, available, "Storage quota exceeded, cleaning up");
        self.cleanup_excluding(&[]);
        if let Err(e) = self.backend.set(key, &stored) {
          warn!(key, error = %e, "Write failed after cleanup, skipped");
          return false;
        }
      }
      Err(e) => {
        warn!(key, error = %e, "Write failed, skipped");
        return false;
      }
    }

    self.check_usage(key);
    true
  }

  fn encode(&self, raw: &str) -> Result<String> {
    let packed = self.codec.compress(raw.as_bytes())?;
    let data = if self.codec.is_textual() {
      String::from_utf8(packed).map_err(|e| eyre!("Codec produced invalid UTF-8: {}", e))?
    } else {
      STANDARD.encode(packed)
    };

    let envelope = Envelope {
      compressed: true,
      codec: self.codec.name().to_string(),
      data,
    };
    let json =
      serde_json::to_string(&envelope).map_err(|e| eyre!("Failed to serialize envelope: {}", e))?;
    Ok(format!("{}{}", ENVELOPE_TAG, json))
  }

  fn decode(&self, raw: &str) -> Result<String> {
    let json = raw.strip_prefix(ENVELOPE_TAG).unwrap_or(raw);
    let envelope: Envelope =
      serde_json::from_str(json).map_err(|e| eyre!("Malformed compressed envelope: {}", e))?;
    if envelope.codec != self.codec.name() {
      return Err(eyre!(
        "Value was compressed with '{}', active codec is '{}'",
        envelope.codec,
        self.codec.name()
      ));
    }

    let packed = if self.codec.is_textual() {
      envelope.data.into_bytes()
    } else {
      STANDARD
        .decode(envelope.data)
        .map_err(|e| eyre!("Malformed compressed payload: {}", e))?
    };
    let bytes = self.codec.decompress(&packed)?;
    String::from_utf8(bytes).map_err(|e| eyre!("Decompressed value is not UTF-8: {}", e))
  }

  /// Post-write usage check: warn at the warn threshold, clean up at the
  /// cleanup threshold. The key just written is never evicted here.
  fn check_usage(&self, written: &str) {
    let stats = self.get_storage_stats();
    let fraction = stats.percentage / 100.0;

    if fraction >= self.config.cleanup_threshold {
      warn!(
        percentage = stats.percentage,
        "Storage above cleanup threshold, evicting"
      );
      self.cleanup_excluding(&[written]);
    } else if fraction >= self.config.warn_threshold {
      warn!(percentage = stats.percentage, "Storage usage is high");
    }
  }

  // ==========================================================================
  // Read path
  // ==========================================================================

  /// Load and decode a value, distinguishing a missing key from a bad one.
  pub fn load_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let Some(raw) = self.backend.get(key)? else {
      return Ok(None);
    };

    let json = if is_envelope(&raw) {
      self.decode(&raw)?
    } else {
      raw
    };

    let value =
      serde_json::from_str(&json).map_err(|e| eyre!("Failed to decode value of {}: {}", key, e))?;
    Ok(Some(value))
  }

  /// Load a value, returning `default` when it is missing or unreadable.
  pub fn get_item_safely<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
    match self.load_item(key) {
      Ok(Some(value)) => value,
      Ok(None) => default,
      Err(e) => {
        warn!(key, error = %e, "Failed to read stored value, using default");
        default
      }
    }
  }

  pub fn remove_item(&self, key: &str) -> bool {
    match self.backend.remove(key) {
      Ok(removed) => removed,
      Err(e) => {
        warn!(key, error = %e, "Failed to remove stored value");
        false
      }
    }
  }

  /// Remove every key starting with `prefix`. Returns how many were removed.
  pub fn remove_prefix(&self, prefix: &str) -> usize {
    self
      .keys()
      .into_iter()
      .filter(|k| k.starts_with(prefix))
      .filter(|k| self.remove_item(k))
      .count()
  }

  fn keys(&self) -> Vec<String> {
    self.backend.keys().unwrap_or_else(|e| {
      warn!(error = %e, "Failed to list stored keys");
      Vec::new()
    })
  }

  // ==========================================================================
  // Accounting and eviction
  // ==========================================================================

  /// Compute a view of every stored item.
  pub fn list_items(&self) -> Vec<StorageItem> {
    self
      .keys()
      .into_iter()
      .filter_map(|key| {
        let meta = self.backend.meta(&key).ok()??;
        let compressed = self
          .backend
          .peek(&key)
          .ok()
          .flatten()
          .map(|raw| is_envelope(&raw))
          .unwrap_or(false);
        Some(StorageItem {
          key,
          size: meta.size,
          last_accessed: meta.last_accessed,
          compressed,
        })
      })
      .collect()
  }

  pub fn get_storage_stats(&self) -> StorageStats {
    let quota = self.backend.quota();
    let used = self.backend.estimate().unwrap_or_else(|| {
      self
        .keys()
        .iter()
        .filter_map(|k| self.backend.meta(k).ok().flatten())
        .map(|m| m.size)
        .sum()
    });

    let percentage = if quota == 0 {
      100.0
    } else {
      used as f64 / quota as f64 * 100.0
    };

    StorageStats {
      used,
      available: quota.saturating_sub(used),
      quota,
      percentage,
    }
  }

  /// Evict non-essential items until usage is below the warn threshold.
  pub fn cleanup_storage(&self) -> CleanupReport {
    self.cleanup_excluding(&[])
  }

  fn cleanup_excluding(&self, protected: &[&str]) -> CleanupReport {
    let stats = self.get_storage_stats();
    let target = (stats.quota as f64 * self.config.warn_threshold) as u64;
    let mut report = CleanupReport::default();
    if stats.used < target {
      return report;
    }

    let candidates: Vec<StorageItem> = self
      .list_items()
      .into_iter()
      .filter(|item| !self.config.is_essential(&item.key))
      .filter(|item| !protected.contains(&item.key.as_str()))
      .collect();

    let mut used = stats.used;
    for item in rank_for_eviction(candidates, &self.config, Utc::now()) {
      if used < target {
        break;
      }
      if self.remove_item(&item.key) {
        debug!(key = %item.key, size = item.size, "Evicted stored item");
        used = used.saturating_sub(item.size);
        report.freed += item.size;
        report.evicted.push(item.key);
      }
    }

    if used >= target {
      warn!(
        used,
        target, "Cleanup could not reach target, remaining items are essential"
      );
    }
    info!(
      evicted = report.evicted.len(),
      freed = report.freed,
      "Storage cleanup finished"
    );
    report
  }

  /// Re-write every uncompressed item above the compression threshold
  /// through the write path. Returns how many items were compressed.
  pub fn optimize_storage(&self) -> usize {
    let mut optimized = 0;

    for key in self.keys() {
      let raw = match self.backend.peek(&key) {
        Ok(Some(raw)) => raw,
        _ => continue,
      };
      if is_envelope(&raw) || raw.len() <= self.config.compression_threshold {
        continue;
      }
      if serde_json::from_str::<serde_json::Value>(&raw).is_err() {
        debug!(key = %key, "Skipping non-JSON value during optimize");
        continue;
      }
      if self.write_raw(&key, raw) {
        optimized += 1;
      }
    }

    info!(optimized, "Storage optimize finished");
    optimized
  }
}

/// Order items for eviction: highest weighted score first.
///
/// Size and age are each normalized against the largest value among the
/// candidates, so one oversized stale blob outranks many small fresh items.
fn rank_for_eviction(
  mut items: Vec<StorageItem>,
  config: &StorageConfig,
  now: DateTime<Utc>,
) -> Vec<StorageItem> {
  let age_ms = |item: &StorageItem| (now - item.last_accessed).num_milliseconds().max(0) as f64;

  let max_size = items.iter().map(|i| i.size).max().unwrap_or(0).max(1) as f64;
  let max_age = items.iter().map(age_ms).fold(0.0_f64, f64::max).max(1.0);

  let score = |item: &StorageItem| {
    config.size_weight * (item.size as f64 / max_size)
      + config.recency_weight * (age_ms(item) / max_age)
  };

  items.sort_by(|a, b| {
    score(b)
      .partial_cmp(&score(a))
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| a.key.cmp(&b.key))
  });
  items
}
