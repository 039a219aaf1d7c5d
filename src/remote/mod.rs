//! Remote document store interface.
//!
//! The store answers ordered, owner-scoped, paginated queries and returns
//! untyped records. Everything past the query cache works with typed shapes.

mod memory;
mod types;

use async_trait::async_trait;
use color_eyre::Result;

pub use memory::MemoryStore;
pub use types::{Cursor, Filter, OrderDirection, QueryRequest, Record, RemotePage};

#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Run one page of an ordered query.
  async fn query(&self, request: QueryRequest) -> Result<RemotePage>;

  /// Read a single record.
  async fn get_one(&self, collection: &str, id: &str) -> Result<Option<Record>>;
}
