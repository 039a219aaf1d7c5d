//! In-process document store, loadable from a JSON fixture file.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use super::types::{Cursor, OrderDirection, QueryRequest, Record, RemotePage};
use super::RemoteStore;

/// Document store held in memory.
///
/// Cursors encode the ordering value and id of the last record of a page, so
/// inserts ahead of the cursor neither duplicate nor skip records.
pub struct MemoryStore {
  collections: RwLock<HashMap<String, Vec<Record>>>,
  available: AtomicBool,
  latency: RwLock<Duration>,
  queries: AtomicUsize,
  lookups: AtomicUsize,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    Self {
      collections: RwLock::new(HashMap::new()),
      available: AtomicBool::new(true),
      latency: RwLock::new(Duration::ZERO),
      queries: AtomicUsize::new(0),
      lookups: AtomicUsize::new(0),
    }
  }

  /// Load collections from a JSON file shaped as
  /// `{"<collection>": [{"id": "...", ...}, ...]}`.
  pub fn from_json_file(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read fixture {}: {}", path.display(), e))?;
    let collections: HashMap<String, Vec<Record>> = serde_json::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse fixture {}: {}", path.display(), e))?;

    let store = Self::new();
    *store
      .collections
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))? = collections;
    Ok(store)
  }

  /// Simulated network latency applied to every call.
  pub fn with_latency(self, latency: Duration) -> Self {
    self.set_latency(latency);
    self
  }

  /// Change the latency of calls made from now on.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
  }

  /// Toggle availability; an unavailable store fails every call.
  pub fn set_available(&self, available: bool) {
    self.available.store(available, AtomicOrdering::SeqCst);
  }

  pub fn insert(&self, collection: &str, record: Record) -> Result<()> {
    let mut collections = self
      .collections
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let records = collections.entry(collection.to_string()).or_default();
    records.retain(|r| r.id != record.id);
    records.push(record);
    Ok(())
  }

  /// Number of `query` calls served so far.
  pub fn query_count(&self) -> usize {
    self.queries.load(AtomicOrdering::SeqCst)
  }

  /// Number of `get_one` calls served so far.
  pub fn lookup_count(&self) -> usize {
    self.lookups.load(AtomicOrdering::SeqCst)
  }

  async fn simulate_network(&self) -> Result<()> {
    let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    if !self.available.load(AtomicOrdering::SeqCst) {
      return Err(eyre!("Remote store unavailable"));
    }
    Ok(())
  }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (a, b) {
    (Some(Value::Number(x)), Some(Value::Number(y))) => x
      .as_f64()
      .partial_cmp(&y.as_f64())
      .unwrap_or(Ordering::Equal),
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
    (None | Some(Value::Null), _) => Ordering::Less,
    (_, None | Some(Value::Null)) => Ordering::Greater,
    (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
  }
}

fn encode_cursor(record: &Record, order_by: &str) -> Cursor {
  let position = serde_json::json!([record.get(order_by), record.id]);
  Cursor::new(position.to_string())
}

fn decode_cursor(cursor: &Cursor) -> Result<(Option<Value>, String)> {
  let (value, id): (Option<Value>, String) = serde_json::from_str(cursor.as_str())
    .map_err(|e| eyre!("Malformed cursor '{}': {}", cursor.as_str(), e))?;
  Ok((value, id))
}

#[async_trait]
impl RemoteStore for MemoryStore {
  async fn query(&self, request: QueryRequest) -> Result<RemotePage> {
    self.queries.fetch_add(1, AtomicOrdering::SeqCst);
    self.simulate_network().await?;

    let mut records: Vec<Record> = {
      let collections = self
        .collections
        .read()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      collections
        .get(&request.collection)
        .map(|records| {
          records
            .iter()
            .filter(|r| {
              request
                .filters
                .iter()
                .all(|f| r.get(&f.field) == Some(&f.value))
            })
            .cloned()
            .collect()
        })
        .unwrap_or_default()
    };

    let order_by = request.order_by.as_str();
    let ordering = |a: &Record, b: &Record| {
      let by_field =
        compare_values(a.get(order_by), b.get(order_by)).then_with(|| a.id.cmp(&b.id));
      match request.direction {
        OrderDirection::Ascending => by_field,
        OrderDirection::Descending => by_field.reverse(),
      }
    };
    records.sort_by(ordering);

    if let Some(cursor) = &request.cursor {
      let (value, id) = decode_cursor(cursor)?;
      let anchor = Record {
        id,
        fields: value
          .map(|v| [(order_by.to_string(), v)].into_iter().collect())
          .unwrap_or_default(),
      };
      records.retain(|r| ordering(r, &anchor) == Ordering::Greater);
    }

    if let Some(limit) = request.limit {
      records.truncate(limit);
    }

    let next_cursor = records.last().map(|r| encode_cursor(r, order_by));
    let records = records
      .into_iter()
      .map(|r| r.without_fields(&request.omit_fields))
      .collect();

    Ok(RemotePage {
      records,
      next_cursor,
    })
  }

  async fn get_one(&self, collection: &str, id: &str) -> Result<Option<Record>> {
    self.lookups.fetch_add(1, AtomicOrdering::SeqCst);
    self.simulate_network().await?;

    let collections = self
      .collections
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      collections
        .get(collection)
        .and_then(|records| records.iter().find(|r| r.id == id).cloned()),
    )
  }
}
