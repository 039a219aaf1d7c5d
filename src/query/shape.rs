//! Query shapes: the parameters that identify one cacheable query.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::remote::{Cursor, Filter, OrderDirection, QueryRequest};

/// Record field holding the owner identifier.
pub const OWNER_FIELD: &str = "userId";

const DEFAULT_PAGE_SIZE: usize = 20;

/// Which fields a query returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Projection {
  Full,
  /// Every field except these (sorted, deduplicated)
  Omit(Vec<String>),
}

impl Projection {
  pub fn omit<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
    fields.sort();
    fields.dedup();
    if fields.is_empty() {
      Projection::Full
    } else {
      Projection::Omit(fields)
    }
  }

  pub fn omitted(&self) -> &[String] {
    match self {
      Projection::Full => &[],
      Projection::Omit(fields) => fields,
    }
  }

  pub fn is_full(&self) -> bool {
    matches!(self, Projection::Full)
  }

  fn key(&self) -> String {
    match self {
      Projection::Full => "full".to_string(),
      Projection::Omit(fields) => format!("omit({})", fields.join(",")),
    }
  }
}

/// Identifies one paginated query.
///
/// Two shapes with equal fields resolve to the same cache slot; any
/// difference, including the projection, gives a different slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryShape {
  pub collection: String,
  pub owner_id: Option<String>,
  pub order_by: String,
  pub direction: OrderDirection,
  pub page_size: usize,
  /// Unpaginated shapes fetch everything in one page
  pub paginated: bool,
  pub projection: Projection,
}

impl QueryShape {
  pub fn new(
    collection: impl Into<String>,
    order_by: impl Into<String>,
    direction: OrderDirection,
  ) -> Self {
    Self {
      collection: collection.into(),
      owner_id: None,
      order_by: order_by.into(),
      direction,
      page_size: DEFAULT_PAGE_SIZE,
      paginated: true,
      projection: Projection::Full,
    }
  }

  pub fn owned_by(mut self, owner_id: impl Into<String>) -> Self {
    self.owner_id = Some(owner_id.into());
    self
  }

  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn unpaginated(mut self) -> Self {
    self.paginated = false;
    self
  }

  pub fn projection(mut self, projection: Projection) -> Self {
    self.projection = projection;
    self
  }

  /// Records per page, `None` for unpaginated shapes.
  pub fn page_limit(&self) -> Option<usize> {
    self.paginated.then_some(self.page_size)
  }

  /// Stable, fixed-length key for this shape.
  pub fn cache_key(&self) -> String {
    let direction = match self.direction {
      OrderDirection::Ascending => "asc",
      OrderDirection::Descending => "desc",
    };
    let limit = self
      .page_limit()
      .map(|n| n.to_string())
      .unwrap_or_else(|| "all".to_string());
    let owner = match &self.owner_id {
      Some(owner) => format!("={}", owner),
      None => "-".to_string(),
    };
    let projection = self.projection.key();

    // Length-prefixed so no field value can shift into its neighbour.
    let mut hasher = Sha256::new();
    for field in [
      self.collection.as_str(),
      owner.as_str(),
      self.order_by.as_str(),
      direction,
      limit.as_str(),
      projection.as_str(),
    ] {
      hasher.update(format!("{}:{};", field.len(), field).as_bytes());
    }
    hex::encode(hasher.finalize())
  }

  /// Storage key under which this shape's pages are persisted.
  pub fn storage_key(&self) -> String {
    let prefix = match &self.owner_id {
      Some(owner) => Self::owner_storage_prefix(owner),
      None => "query:_:".to_string(),
    };
    format!("{}{}", prefix, self.cache_key())
  }

  /// Prefix shared by every persisted page of one owner.
  ///
  /// The owner id is hex-encoded, so no owner's prefix is a prefix of another's.
  pub fn owner_storage_prefix(owner_id: &str) -> String {
    format!("query:{}:", hex::encode(owner_id))
  }

  pub fn description(&self) -> String {
    let mut description = format!("{} by {}", self.collection, self.order_by);
    if let Some(owner) = &self.owner_id {
      description.push_str(&format!(" for {}", owner));
    }
    if !self.projection.is_full() {
      description.push_str(" (reduced)");
    }
    description
  }

  /// Build the remote request for the page after `cursor`.
  pub fn request(&self, cursor: Option<Cursor>) -> QueryRequest {
    QueryRequest {
      collection: self.collection.clone(),
      filters: self
        .owner_id
        .iter()
        .map(|owner| Filter::equals(OWNER_FIELD, owner.as_str()))
        .collect(),
      order_by: self.order_by.clone(),
      direction: self.direction,
      limit: self.page_limit(),
      cursor,
      omit_fields: self.projection.omitted().to_vec(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn shape() -> QueryShape {
    QueryShape::new("analyses", "timestamp", OrderDirection::Descending).owned_by("u1")
  }

  #[test]
  fn test_identical_shapes_share_key() {
    assert_eq!(shape().cache_key(), shape().cache_key());
    assert_eq!(shape().cache_key().len(), 64);
  }

  #[test]
  fn test_projection_changes_key() {
    let reduced = shape().projection(Projection::omit(["image"]));
    assert_ne!(shape().cache_key(), reduced.cache_key());
    assert_eq!(
      reduced.cache_key(),
      shape()
        .projection(Projection::omit(["image", "image"]))
        .cache_key()
    );
  }

  #[test]
  fn test_pagination_changes_key() {
    assert_ne!(shape().cache_key(), shape().unpaginated().cache_key());
    assert_ne!(shape().cache_key(), shape().page_size(50).cache_key());
  }

  #[test]
  fn test_request_carries_owner_filter_and_limit() {
    let request = shape().page_size(5).request(None);
    assert_eq!(request.filters, vec![Filter::equals("userId", "u1")]);
    assert_eq!(request.limit, Some(5));

    assert_eq!(shape().unpaginated().request(None).limit, None);
  }

  #[test]
  fn test_storage_key_is_scoped_by_owner() {
    assert!(shape()
      .storage_key()
      .starts_with(&QueryShape::owner_storage_prefix("u1")));
    assert_eq!(Projection::omit(Vec::<String>::new()), Projection::Full);
  }

  #[test]
  fn test_owner_with_separator_does_not_share_prefix() {
    let nested = QueryShape::new("analyses", "timestamp", OrderDirection::Descending).owned_by("u1:x");
    assert!(!nested
      .storage_key()
      .starts_with(&QueryShape::owner_storage_prefix("u1")));
    assert_ne!(nested.cache_key(), shape().cache_key());

    // Fields can not bleed into each other through the separator.
    let a = QueryShape::new("a:b", "timestamp", OrderDirection::Descending).owned_by("c");
    let b = QueryShape::new("a", "timestamp", OrderDirection::Descending).owned_by("b:c");
    assert_ne!(a.cache_key(), b.cache_key());
  }
}
