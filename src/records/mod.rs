//! Analysis records: remote shape, typed domain shapes, query shapes and
//! fallback samples.

pub mod api_types;
mod cache;
pub mod sample;
pub mod types;

pub use cache::{aggregate_shape, history_shape, recents_shape, ANALYSES_COLLECTION, ORDER_FIELD};
pub use types::{AnalysisStatus, Analytics, HistoryItem, HistoryPatch, Severity, UserStats};
