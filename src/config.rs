use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub rate_limit: RateLimitConfig,
}

/// Settings for the named caches and the paginated query cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Seconds before an entry is considered stale
  pub ttl_secs: u64,
  /// Records per page for paginated shapes
  pub page_size: usize,
  /// Maximum number of entries kept in the recents cache
  pub recents_limit: usize,
  /// Schedule a refresh of stale/missing slots after sign-in
  pub prefetch_on_sign_in: bool,
  /// Delay before the sign-in prefetch starts, in milliseconds
  pub prefetch_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 5 * 60,
      page_size: 20,
      recents_limit: 10,
      prefetch_on_sign_in: true,
      prefetch_delay_ms: 1_000,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }

  pub fn prefetch_delay(&self) -> Duration {
    Duration::from_millis(self.prefetch_delay_ms)
  }
}

/// Settings for the persistent storage manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Total bytes the backend may hold
  pub quota_bytes: u64,
  /// Serialized values larger than this are compressed
  pub compression_threshold: usize,
  /// Values still larger than this after compression are rejected
  pub max_item_size: usize,
  /// Usage fraction that logs a warning and that cleanup drains below
  pub warn_threshold: f64,
  /// Usage fraction that triggers a cleanup after a write
  pub cleanup_threshold: f64,
  /// Weight of item size in the eviction score
  pub size_weight: f64,
  /// Weight of time since last access in the eviction score
  pub recency_weight: f64,
  /// Keys that are never evicted
  pub essential_keys: Vec<String>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      quota_bytes: 5 * 1024 * 1024,
      compression_threshold: 1024,
      max_item_size: 1024 * 1024,
      warn_threshold: 0.8,
      cleanup_threshold: 0.9,
      size_weight: 0.7,
      recency_weight: 0.3,
      essential_keys: vec![
        "auth_token".to_string(),
        "user_preferences".to_string(),
        "app_settings".to_string(),
      ],
    }
  }
}

impl StorageConfig {
  pub fn is_essential(&self, key: &str) -> bool {
    self.essential_keys.iter().any(|k| k == key)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  /// Quiet period for search-as-you-type, in milliseconds
  pub search_debounce_ms: u64,
  /// Minimum spacing of UI-triggered refreshes per cache, in milliseconds
  pub refresh_throttle_ms: u64,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      search_debounce_ms: 300,
      refresh_throttle_ms: 1_000,
    }
  }
}

impl RateLimitConfig {
  pub fn search_debounce(&self) -> Duration {
    Duration::from_millis(self.search_debounce_ms)
  }

  pub fn refresh_throttle(&self) -> Duration {
    Duration::from_millis(self.refresh_throttle_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./datacache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/datacache/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("datacache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("datacache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Check relationships between settings that serde cannot express.
  pub fn validate(&self) -> Result<()> {
    let storage = &self.storage;
    if !(0.0..1.0).contains(&storage.warn_threshold) {
      return Err(eyre!(
        "storage.warn_threshold must be within [0, 1), got {}",
        storage.warn_threshold
      ));
    }
    if storage.cleanup_threshold <= storage.warn_threshold || storage.cleanup_threshold > 1.0 {
      return Err(eyre!(
        "storage.cleanup_threshold must be above warn_threshold ({}) and at most 1, got {}",
        storage.warn_threshold,
        storage.cleanup_threshold
      ));
    }
    if storage.max_item_size as u64 > storage.quota_bytes {
      return Err(eyre!(
        "storage.max_item_size ({}) exceeds quota_bytes ({})",
        storage.max_item_size,
        storage.quota_bytes
      ));
    }
    if self.cache.page_size == 0 {
      return Err(eyre!("cache.page_size must be at least 1"));
    }
    Ok(())
  }

  /// Default location of the SQLite storage file.
  pub fn default_db_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("datacache").join("storage.db"))
  }
}
