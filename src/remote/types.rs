use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An untyped document as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Record {
  pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
    Self {
      id: id.into(),
      fields,
    }
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.fields.get(field)
  }

  /// Drop the named fields, keeping `id`.
  pub fn without_fields(mut self, omit: &[String]) -> Self {
    for field in omit {
      self.fields.remove(field);
    }
    self
  }
}

/// Opaque position marker issued by the store for the last record of a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
  Ascending,
  Descending,
}

/// Equality filter on a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  pub value: Value,
}

impl Filter {
  pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self {
      field: field.into(),
      value: value.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
  pub collection: String,
  pub filters: Vec<Filter>,
  pub order_by: String,
  pub direction: OrderDirection,
  /// `None` fetches every matching record in one page
  pub limit: Option<usize>,
  /// Start after the record this cursor was issued for
  pub cursor: Option<Cursor>,
  /// Fields the store may leave out of the returned records
  pub omit_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemotePage {
  pub records: Vec<Record>,
  /// Cursor bound to the last record of this page
  pub next_cursor: Option<Cursor>,
}
