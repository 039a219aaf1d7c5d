//! Per-shape cache of merged result pages.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::shape::{Projection, QueryShape};
use crate::cache::Cacheable;
use crate::remote::{Cursor, RemoteStore};
use crate::storage::StorageManager;

/// One fetched page, already validated into typed records.
#[derive(Debug, Clone)]
pub struct Page<T> {
  pub records: Vec<T>,
  pub next_cursor: Option<Cursor>,
  pub exhausted: bool,
}

/// Snapshot of a cached query for display.
///
/// `error` is set by the last failed fetch and does not replace `records`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryView<T> {
  pub records: Vec<T>,
  pub exhausted: bool,
  pub projection: Projection,
  pub fetched_at: Option<DateTime<Utc>>,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageSlot<T> {
  shape: QueryShape,
  records: Vec<T>,
  cursor: Option<Cursor>,
  exhausted: bool,
  fetched_at: DateTime<Utc>,
  #[serde(skip)]
  error: Option<String>,
  #[serde(skip)]
  stale: bool,
  /// Ticket of the refresh these records descend from
  #[serde(skip)]
  ticket: u64,
}

impl<T: Clone> PageSlot<T> {
  fn view(&self) -> QueryView<T> {
    QueryView {
      records: self.records.clone(),
      exhausted: self.exhausted,
      projection: self.shape.projection.clone(),
      fetched_at: Some(self.fetched_at),
      error: self.error.clone(),
    }
  }
}

type PageFuture<T> = Shared<BoxFuture<'static, Result<Page<T>, String>>>;

struct Inner<T> {
  slots: HashMap<String, PageSlot<T>>,
  inflight: HashMap<(String, Option<Cursor>), PageFuture<T>>,
  /// Failures of shapes that have no cached pages yet
  errors: HashMap<String, String>,
  next_ticket: u64,
  /// Bumped by `clear`; results started under an older epoch are dropped
  epoch: u64,
}

/// Fetches, merges and caches ordered result pages per [`QueryShape`].
///
/// - concurrent requests for the same shape and cursor share one fetch
/// - `refresh` replaces the pages, `load_more` appends the next one
/// - pages are persisted through the storage manager and restored while fresh
/// - failures keep cached pages and set an error flag; nothing is retried
pub struct PaginatedQueryCache<T: Cacheable> {
  remote: Arc<dyn RemoteStore>,
  storage: Option<Arc<StorageManager>>,
  ttl: Duration,
  inner: Mutex<Inner<T>>,
}

impl<T: Cacheable> PaginatedQueryCache<T> {
  pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
    Self {
      remote,
      storage: None,
      ttl: Duration::from_secs(5 * 60),
      inner: Mutex::new(Inner {
        slots: HashMap::new(),
        inflight: HashMap::new(),
        errors: HashMap::new(),
        next_ticket: 0,
        epoch: 0,
      }),
    }
  }

  /// Persist pages through `storage` and restore them before hitting the network.
  pub fn with_storage(mut self, storage: Arc<StorageManager>) -> Self {
    self.storage = Some(storage);
    self
  }

  /// How long persisted pages may be restored without a network fetch.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  // ==========================================================================
  // Network
  // ==========================================================================

  /// Fetch one page from the remote store.
  ///
  /// A second request for the same shape and cursor while one is outstanding
  /// awaits the same result instead of issuing another round-trip.
  pub async fn fetch_page(&self, shape: &QueryShape, cursor: Option<Cursor>) -> Result<Page<T>> {
    let key = (shape.cache_key(), cursor.clone());

    let future = {
      let mut inner = self.lock();
      if let Some(existing) = inner.inflight.get(&key).cloned() {
        debug!(query = %shape.description(), "Joining in-flight page fetch");
        existing
      } else {
        let future = Self::page_future(Arc::clone(&self.remote), shape.clone(), cursor).shared();
        inner.inflight.insert(key.clone(), future.clone());
        future
      }
    };

    let result = future.clone().await;

    {
      let mut inner = self.lock();
      if inner
        .inflight
        .get(&key)
        .map(|f| f.ptr_eq(&future))
        .unwrap_or(false)
      {
        inner.inflight.remove(&key);
      }
    }

    result.map_err(|e| eyre!(e))
  }

  fn page_future(
    remote: Arc<dyn RemoteStore>,
    shape: QueryShape,
    cursor: Option<Cursor>,
  ) -> BoxFuture<'static, Result<Page<T>, String>> {
    async move {
      debug!(query = %shape.description(), after = ?cursor, "Fetching page");
      let page = remote
        .query(shape.request(cursor))
        .await
        .map_err(|e| format!("Failed to fetch {}: {}", shape.description(), e))?;

      let fetched = page.records.len();
      let omit = shape.projection.omitted();
      let records = page
        .records
        .into_iter()
        .filter_map(|record| {
          let id = record.id.clone();
          match T::from_record(record.without_fields(omit)) {
            Ok(record) => Some(record),
            Err(e) => {
              warn!(id = %id, error = %e, "Dropping invalid record");
              None
            }
          }
        })
        .collect();

      let exhausted = match shape.page_limit() {
        Some(limit) => fetched < limit,
        None => true,
      };

      Ok(Page {
        records,
        next_cursor: if exhausted { None } else { page.next_cursor },
        exhausted,
      })
    }
    .boxed()
  }

  /// Fetch a single record by id.
  pub async fn fetch_one(&self, id: &str) -> Result<Option<T>> {
    self
      .remote
      .get_one(T::entity_type(), id)
      .await?
      .map(T::from_record)
      .transpose()
  }

  // ==========================================================================
  // Cached access
  // ==========================================================================

  /// Cached pages for `shape`: memory first, then persisted pages that are
  /// still fresh, then the first page from the network.
  pub async fn load(&self, shape: &QueryShape) -> Result<QueryView<T>> {
    let key = shape.cache_key();

    let epoch = {
      let inner = self.lock();
      if let Some(slot) = inner.slots.get(&key) {
        if !slot.stale {
          debug!(query = %shape.description(), "Query cache hit");
          return Ok(slot.view());
        }
      }
      inner.epoch
    };

    if let Some(restored) = self.restore(shape) {
      let mut inner = self.lock();
      if inner.epoch == epoch {
        let slot = inner.slots.entry(key).or_insert(restored);
        debug!(query = %shape.description(), "Restored pages from storage");
        return Ok(slot.view());
      }
    }

    self.refresh(shape).await
  }

  /// Fetch the first page again, replacing every cached page and the cursor.
  pub async fn refresh(&self, shape: &QueryShape) -> Result<QueryView<T>> {
    let key = shape.cache_key();
    let (ticket, epoch) = {
      let mut inner = self.lock();
      inner.next_ticket += 1;
      (inner.next_ticket, inner.epoch)
    };

    let page = match self.fetch_page(shape, None).await {
      Ok(page) => page,
      Err(e) => {
        self.record_error(&key, epoch, &e);
        return Err(e);
      }
    };

    let slot = {
      let mut inner = self.lock();
      if inner.epoch != epoch {
        return Err(eyre!(
          "Query cache was cleared while {} was loading",
          shape.description()
        ));
      }
      inner.errors.remove(&key);

      let superseded = inner
        .slots
        .get(&key)
        .map(|slot| slot.ticket > ticket)
        .unwrap_or(false);
      if superseded {
        debug!(query = %shape.description(), "Newer refresh already applied");
      } else {
        inner.slots.insert(
          key.clone(),
          PageSlot {
            shape: shape.clone(),
            records: page.records,
            cursor: page.next_cursor,
            exhausted: page.exhausted,
            fetched_at: Utc::now(),
            error: None,
            stale: false,
            ticket,
          },
        );
      }
      inner.slots.get(&key).cloned()
    };

    let slot = slot.ok_or_else(|| eyre!("Pages for {} disappeared", shape.description()))?;
    self.persist(&slot);
    Ok(slot.view())
  }

  /// Fetch the page after the cursor and append it.
  ///
  /// Without cached pages this is a refresh; once exhausted it is a no-op.
  pub async fn load_more(&self, shape: &QueryShape) -> Result<QueryView<T>> {
    let key = shape.cache_key();

    let start = {
      let inner = self.lock();
      let epoch = inner.epoch;
      inner.slots.get(&key).map(|slot| {
        (
          slot.exhausted,
          slot.cursor.clone(),
          slot.ticket,
          epoch,
          slot.view(),
        )
      })
    };
    let Some((exhausted, cursor, base_ticket, epoch, current)) = start else {
      return self.refresh(shape).await;
    };
    if exhausted || cursor.is_none() {
      return Ok(current);
    }

    let page = match self.fetch_page(shape, cursor.clone()).await {
      Ok(page) => page,
      Err(e) => {
        self.record_error(&key, epoch, &e);
        return Err(e);
      }
    };

    let slot = {
      let mut inner = self.lock();
      if inner.epoch != epoch {
        return Err(eyre!(
          "Query cache was cleared while {} was loading",
          shape.description()
        ));
      }

      match inner.slots.get_mut(&key) {
        Some(slot) if slot.ticket == base_ticket && slot.cursor == cursor => {
          let known: HashSet<String> = slot.records.iter().map(|r| r.cache_key()).collect();
          slot.records.extend(
            page
              .records
              .into_iter()
              .filter(|r| !known.contains(&r.cache_key())),
          );
          slot.cursor = page.next_cursor;
          slot.exhausted = page.exhausted;
          slot.fetched_at = Utc::now();
          slot.error = None;
        }
        _ => debug!(query = %shape.description(), "Discarding superseded page"),
      }
      inner.slots.get(&key).cloned()
    };

    let slot = slot.ok_or_else(|| eyre!("Pages for {} disappeared", shape.description()))?;
    self.persist(&slot);
    Ok(slot.view())
  }

  /// Current cached view, including the error flag of the last fetch.
  pub fn view(&self, shape: &QueryShape) -> Option<QueryView<T>> {
    let key = shape.cache_key();
    let inner = self.lock();
    if let Some(slot) = inner.slots.get(&key) {
      return Some(slot.view());
    }
    inner.errors.get(&key).map(|error| QueryView {
      records: Vec::new(),
      exhausted: false,
      projection: shape.projection.clone(),
      fetched_at: None,
      error: Some(error.clone()),
    })
  }

  /// Whether any page of `shape` is being fetched.
  pub fn is_loading(&self, shape: &QueryShape) -> bool {
    let key = shape.cache_key();
    self.lock().inflight.keys().any(|(k, _)| *k == key)
  }

  // ==========================================================================
  // Invalidation
  // ==========================================================================

  /// Mark the pages of `shape` stale so the next `load` fetches again.
  pub fn invalidate(&self, shape: &QueryShape) {
    if let Some(slot) = self.lock().slots.get_mut(&shape.cache_key()) {
      slot.stale = true;
    }
    if let Some(storage) = &self.storage {
      storage.remove_item(&shape.storage_key());
    }
  }

  /// Mark every cached shape of `owner_id` stale.
  pub fn invalidate_owner(&self, owner_id: &str) {
    {
      let mut inner = self.lock();
      for slot in inner.slots.values_mut() {
        if slot.shape.owner_id.as_deref() == Some(owner_id) {
          slot.stale = true;
        }
      }
    }
    if let Some(storage) = &self.storage {
      storage.remove_prefix(&QueryShape::owner_storage_prefix(owner_id));
    }
  }

  /// Drop everything held in memory. In-flight results are discarded.
  pub fn clear(&self) {
    let mut inner = self.lock();
    inner.slots.clear();
    inner.inflight.clear();
    inner.errors.clear();
    inner.epoch += 1;
  }

  /// Drop everything of `owner_id`, in memory and persisted.
  pub fn clear_owner(&self, owner_id: &str) {
    {
      let mut inner = self.lock();
      inner
        .slots
        .retain(|_, slot| slot.shape.owner_id.as_deref() != Some(owner_id));
      inner.inflight.clear();
      inner.errors.clear();
      inner.epoch += 1;
    }
    if let Some(storage) = &self.storage {
      storage.remove_prefix(&QueryShape::owner_storage_prefix(owner_id));
    }
  }

  // ==========================================================================
  // Persistence
  // ==========================================================================

  fn restore(&self, shape: &QueryShape) -> Option<PageSlot<T>> {
    let storage = self.storage.as_ref()?;

    let slot: PageSlot<T> = match storage.load_item(&shape.storage_key()) {
      Ok(Some(slot)) => slot,
      Ok(None) => return None,
      Err(e) => {
        warn!(query = %shape.description(), error = %e, "Ignoring unreadable persisted pages");
        return None;
      }
    };

    // A slot filled under another projection is never a substitute.
    if slot.shape != *shape {
      return None;
    }

    let age = (Utc::now() - slot.fetched_at).to_std().unwrap_or_default();
    if age >= self.ttl {
      debug!(query = %shape.description(), "Persisted pages are stale");
      return None;
    }
    Some(slot)
  }

  fn persist(&self, slot: &PageSlot<T>) {
    if let Some(storage) = &self.storage {
      if !storage.set_item_safely(&slot.shape.storage_key(), slot) {
        debug!(query = %slot.shape.description(), "Pages not persisted");
      }
    }
  }

  fn record_error(&self, key: &str, epoch: u64, error: &color_eyre::Report) {
    let mut inner = self.lock();
    if inner.epoch != epoch {
      return;
    }
    match inner.slots.get_mut(key) {
      Some(slot) => slot.error = Some(error.to_string()),
      None => {
        inner.errors.insert(key.to_string(), error.to_string());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StorageConfig;
  use crate::records::{aggregate_shape, history_shape, HistoryItem, ANALYSES_COLLECTION};
  use crate::remote::{MemoryStore, Record};
  use crate::storage::MemoryBackend;
  use serde_json::json;

  fn analysis(i: usize, owner: &str) -> Record {
    let fields = json!({
      "userId": owner,
      "timestamp": format!("2024-01-01T00:{:02}:{:02}Z", i / 60, i % 60),
      "damageType": "Dent",
      "severity": "minor",
      "estimatedCost": (i * 10) as f64,
      "status": "completed",
      "image": "heavy-blob",
    });
    Record::new(format!("rec-{i:03}"), fields.as_object().cloned().unwrap())
  }

  fn store_with(count: usize) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    for i in 0..count {
      store.insert(ANALYSES_COLLECTION, analysis(i, "u1")).unwrap();
    }
    Arc::new(store)
  }

  fn cache(store: &Arc<MemoryStore>) -> PaginatedQueryCache<HistoryItem> {
    PaginatedQueryCache::new(store.clone())
  }

  fn storage() -> Arc<StorageManager> {
    Arc::new(StorageManager::new(
      Arc::new(MemoryBackend::new(4 << 20)),
      StorageConfig {
        quota_bytes: 4 << 20,
        ..StorageConfig::default()
      },
    ))
  }

  #[tokio::test]
  async fn test_load_more_appends_until_exhausted() {
    let store = store_with(35);
    let cache = cache(&store);
    let shape = history_shape("u1", 20);

    let first = cache.load(&shape).await.unwrap();
    assert_eq!(first.records.len(), 20);
    assert!(!first.exhausted);

    let second = cache.load_more(&shape).await.unwrap();
    assert_eq!(second.records.len(), 35);
    assert!(second.exhausted);
    assert_eq!(second.records[0].id, "rec-034");
    assert_eq!(second.records[34].id, "rec-000");

    // Exhausted: no further network call.
    let calls = store.query_count();
    cache.load_more(&shape).await.unwrap();
    assert_eq!(store.query_count(), calls);
  }

  #[tokio::test]
  async fn test_repeated_load_hits_cache() {
    let store = store_with(5);
    let cache = cache(&store);
    let shape = history_shape("u1", 20);

    let a = cache.load(&shape).await.unwrap();
    let b = cache.load(&shape).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(store.query_count(), 1);
    assert!(a.exhausted);
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_one_request() {
    let store = Arc::new(
      MemoryStore::new().with_latency(Duration::from_millis(20)),
    );
    store.insert(ANALYSES_COLLECTION, analysis(1, "u1")).unwrap();
    let cache = cache(&store);
    let shape = history_shape("u1", 20);

    let (a, b) = tokio::join!(cache.refresh(&shape), cache.refresh(&shape));
    assert_eq!(a.unwrap().records, b.unwrap().records);
    assert_eq!(store.query_count(), 1);
    assert!(!cache.is_loading(&shape));
  }

  #[tokio::test]
  async fn test_refresh_replaces_pages_and_resets_cursor() {
    let store = store_with(25);
    let cache = cache(&store);
    let shape = history_shape("u1", 20);

    cache.load(&shape).await.unwrap();
    assert_eq!(cache.load_more(&shape).await.unwrap().records.len(), 25);

    let refreshed = cache.refresh(&shape).await.unwrap();
    assert_eq!(refreshed.records.len(), 20);
    assert!(!refreshed.exhausted);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_supersedes_slower_load_more() {
    let store = store_with(35);
    let cache = cache(&store);
    let shape = history_shape("u1", 20);
    cache.load(&shape).await.unwrap();

    store.set_latency(Duration::from_millis(100));
    let (more, refreshed) = tokio::join!(cache.load_more(&shape), async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      store.set_latency(Duration::ZERO);
      cache.refresh(&shape).await
    });

    assert_eq!(refreshed.unwrap().records.len(), 20);
    // The appended page belonged to the replaced pages.
    assert_eq!(more.unwrap().records.len(), 20);
    let view = cache.view(&shape).unwrap();
    assert_eq!(view.records.len(), 20);
    assert!(!view.exhausted);
    assert_eq!(store.query_count(), 3);
  }

  #[tokio::test]
  async fn test_failure_keeps_pages_and_sets_error() {
    let store = store_with(30);
    let cache = cache(&store);
    let shape = history_shape("u1", 20);
    cache.load(&shape).await.unwrap();

    store.set_available(false);
    assert!(cache.load_more(&shape).await.is_err());

    let view = cache.view(&shape).unwrap();
    assert_eq!(view.records.len(), 20);
    assert!(view.error.is_some());

    // Not retried on its own; an explicit retry clears the flag.
    store.set_available(true);
    let view = cache.load_more(&shape).await.unwrap();
    assert_eq!(view.records.len(), 30);
    assert!(view.error.is_none());
  }

  #[tokio::test]
  async fn test_failure_without_pages_is_visible_in_view() {
    let store = store_with(3);
    store.set_available(false);
    let cache = cache(&store);
    let shape = history_shape("u1", 20);

    assert!(cache.load(&shape).await.is_err());
    let view = cache.view(&shape).unwrap();
    assert!(view.records.is_empty());
    assert!(view.error.is_some());
  }

  #[tokio::test]
  async fn test_reduced_projection_strips_heavy_fields() {
    let store = store_with(3);
    let cache = cache(&store);

    let reduced = cache.load(&aggregate_shape("u1")).await.unwrap();
    assert!(reduced.records.iter().all(|r| r.image.is_none()));
    assert!(reduced.exhausted);

    let full = cache.load(&history_shape("u1", 20)).await.unwrap();
    assert!(full.records.iter().all(|r| r.image.is_some()));
    assert_eq!(store.query_count(), 2);
  }

  #[tokio::test]
  async fn test_persisted_pages_are_restored_before_network() {
    let store = store_with(5);
    let storage = storage();
    let shape = history_shape("u1", 20);

    PaginatedQueryCache::<HistoryItem>::new(store.clone())
      .with_storage(storage.clone())
      .load(&shape)
      .await
      .unwrap();
    assert_eq!(store.query_count(), 1);

    let fresh_cache = PaginatedQueryCache::<HistoryItem>::new(store.clone()).with_storage(storage);
    let view = fresh_cache.load(&shape).await.unwrap();
    assert_eq!(view.records.len(), 5);
    assert_eq!(store.query_count(), 1);
  }

  #[tokio::test]
  async fn test_stale_persisted_pages_are_refetched() {
    let store = store_with(5);
    let storage = storage();
    let shape = history_shape("u1", 20);

    PaginatedQueryCache::<HistoryItem>::new(store.clone())
      .with_storage(storage.clone())
      .load(&shape)
      .await
      .unwrap();

    let expired = PaginatedQueryCache::<HistoryItem>::new(store.clone())
      .with_storage(storage)
      .with_ttl(Duration::ZERO);
    expired.load(&shape).await.unwrap();
    assert_eq!(store.query_count(), 2);
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let store = store_with(5);
    let cache = cache(&store);
    let shape = history_shape("u1", 20);

    cache.load(&shape).await.unwrap();
    cache.invalidate(&shape);
    cache.load(&shape).await.unwrap();
    assert_eq!(store.query_count(), 2);
  }

  #[tokio::test]
  async fn test_clear_owner_removes_memory_and_storage() {
    let store = store_with(5);
    let storage = storage();
    let cache = PaginatedQueryCache::<HistoryItem>::new(store.clone()).with_storage(storage.clone());
    let shape = history_shape("u1", 20);

    cache.load(&shape).await.unwrap();
    let prefix = QueryShape::owner_storage_prefix("u1");
    assert!(storage.list_items().iter().any(|i| i.key.starts_with(&prefix)));

    cache.clear_owner("u1");
    assert!(cache.view(&shape).is_none());
    assert!(storage.list_items().is_empty());
  }

  #[tokio::test]
  async fn test_clear_owner_leaves_owner_with_longer_id() {
    let store = store_with(3);
    store.insert(ANALYSES_COLLECTION, analysis(7, "u1:x")).unwrap();
    let storage = storage();
    let cache = PaginatedQueryCache::<HistoryItem>::new(store.clone()).with_storage(storage.clone());
    let own = history_shape("u1", 20);
    let other = history_shape("u1:x", 20);

    cache.load(&own).await.unwrap();
    assert_eq!(cache.load(&other).await.unwrap().records.len(), 1);
    assert_eq!(storage.list_items().len(), 2);

    cache.clear_owner("u1");
    let remaining = storage.list_items();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key, other.storage_key());
    assert_eq!(cache.view(&other).unwrap().records.len(), 1);

    cache.invalidate_owner("u1");
    assert_eq!(storage.list_items().len(), 1);
  }

  #[tokio::test]
  async fn test_fetch_one() {
    let store = store_with(3);
    let cache = cache(&store);

    let item = cache.fetch_one("rec-001").await.unwrap().unwrap();
    assert_eq!(item.estimated_cost, 10.0);
    assert!(cache.fetch_one("missing").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_invalid_records_are_dropped_at_the_boundary() {
    let store = store_with(2);
    let broken = json!({ "userId": "u1", "timestamp": "not a date" });
    store
      .insert(
        ANALYSES_COLLECTION,
        Record::new("broken", broken.as_object().cloned().unwrap()),
      )
      .unwrap();
    let cache = cache(&store);

    let view = cache.load(&history_shape("u1", 20)).await.unwrap();
    assert_eq!(view.records.len(), 2);
  }
}
