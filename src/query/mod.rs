//! Paginated queries against the remote store, cached per query shape.

mod cache;
mod shape;

pub use cache::{Page, PaginatedQueryCache, QueryView};
pub use shape::{Projection, QueryShape, OWNER_FIELD};
