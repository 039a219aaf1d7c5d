//! Client-side caching and synchronization for analysis records.
//!
//! Layers, leaf first:
//! - [`ratelimit`]: debounce and throttle for UI triggers
//! - [`storage`]: quota-aware persistence with compression and eviction
//! - [`query`]: paginated, per-shape cache of remote query results
//! - [`cache`]: the [`DataCache`](cache::DataCache) orchestrator with named
//!   caches and the session lifecycle

pub mod cache;
pub mod config;
pub mod query;
pub mod ratelimit;
pub mod records;
pub mod remote;
pub mod storage;
