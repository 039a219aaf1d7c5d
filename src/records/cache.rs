//! Caching implementations for analysis records.

use color_eyre::Result;

use super::api_types::ApiAnalysis;
use super::types::HistoryItem;
use crate::cache::Cacheable;
use crate::query::{Projection, QueryShape};
use crate::remote::{OrderDirection, Record};

/// Remote collection holding analysis records.
pub const ANALYSES_COLLECTION: &str = "analyses";

/// Field the analyses are ordered by.
pub const ORDER_FIELD: &str = "timestamp";

/// Heavy fields left out of list and aggregate queries.
const HEAVY_FIELDS: &[&str] = &["image", "imageData"];

impl Cacheable for HistoryItem {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    ANALYSES_COLLECTION
  }

  fn from_record(record: Record) -> Result<Self> {
    ApiAnalysis::from_record(record)?.into_history_item()
  }
}

fn reduced() -> Projection {
  Projection::omit(HEAVY_FIELDS.iter().copied())
}

/// Newest-first history pages, with image payloads.
pub fn history_shape(owner_id: &str, page_size: usize) -> QueryShape {
  QueryShape::new(ANALYSES_COLLECTION, ORDER_FIELD, OrderDirection::Descending)
    .owned_by(owner_id)
    .page_size(page_size)
}

/// The most recent analyses, without image payloads.
pub fn recents_shape(owner_id: &str, limit: usize) -> QueryShape {
  QueryShape::new(ANALYSES_COLLECTION, ORDER_FIELD, OrderDirection::Descending)
    .owned_by(owner_id)
    .page_size(limit)
    .projection(reduced())
}

/// Every analysis of the owner in one unpaginated page, without image
/// payloads. Shared by the analytics and stats caches.
pub fn aggregate_shape(owner_id: &str) -> QueryShape {
  QueryShape::new(ANALYSES_COLLECTION, ORDER_FIELD, OrderDirection::Descending)
    .owned_by(owner_id)
    .unpaginated()
    .projection(reduced())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_shapes_do_not_share_slots() {
    let history = history_shape("u1", 20);
    let recents = recents_shape("u1", 20);
    let aggregate = aggregate_shape("u1");

    assert_ne!(history.cache_key(), recents.cache_key());
    assert_ne!(recents.cache_key(), aggregate.cache_key());
    assert_ne!(history.cache_key(), history_shape("u2", 20).cache_key());
    assert_eq!(history.cache_key(), history_shape("u1", 20).cache_key());
  }
}
