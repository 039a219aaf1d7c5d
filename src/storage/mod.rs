//! Persistent storage manager.
//!
//! Quota-aware key/value persistence used by the caches to survive restarts:
//! - values above a size threshold are compressed through a pluggable [`Codec`]
//! - writes past the quota trigger one evict-and-retry cycle, never an error
//! - eviction ranks items by size and age, and never touches essential keys

mod backend;
mod codec;
mod manager;
mod sqlite;

pub use backend::{BackendError, ItemMeta, MemoryBackend, StorageBackend};
pub use codec::{Codec, KeyTokenCodec, MinifyCodec};
pub use manager::{CleanupReport, StorageItem, StorageManager, StorageStats};
pub use sqlite::SqliteBackend;
