//! Named caches with stale-while-revalidate reads.
//!
//! [`DataCache`] holds one entry per [`CacheName`] for the signed-in user:
//! - reads return cached data at once and refresh stale entries in the background
//! - misses go through the paginated query cache, which checks persisted pages
//!   before the network
//! - local mutations edit the cached lists and invalidate the aggregates
//! - the whole state is persisted per user and restored on sign-in

mod data_cache;
mod entry;
mod slots;
mod traits;

pub use data_cache::{snapshot_key, AuthEvent, DataCache};
pub use entry::{CacheEntry, CacheName, CacheState, CacheStatus, SlotStatus};
pub use slots::{AnalyticsSlot, FetchContext, HistorySlot, NamedCache, RecentsSlot, UserStatsSlot};
pub use traits::{CacheResult, CacheSource, Cacheable};
