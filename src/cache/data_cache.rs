//! Cache orchestrator: named caches over the query cache and storage.

use chrono::Utc;
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CacheName, CacheState, CacheStatus};
use super::slots::{AnalyticsSlot, FetchContext, HistorySlot, NamedCache, RecentsSlot, UserStatsSlot};
use super::traits::CacheResult;
use crate::config::{CacheConfig, Config};
use crate::query::PaginatedQueryCache;
use crate::ratelimit::{Debouncer, Throttle};
use crate::records::{history_shape, Analytics, HistoryItem, HistoryPatch, UserStats};
use crate::remote::RemoteStore;
use crate::storage::StorageManager;

/// Identity changes that drive the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
  SignedIn(String),
  SignedOut,
}

/// Storage key of a user's persisted [`CacheState`].
pub fn snapshot_key(user_id: &str) -> String {
  format!("datacache:snapshot:{}", user_id)
}

type SettleFuture = Shared<BoxFuture<'static, Result<(), String>>>;

struct Inflight {
  ticket: u64,
  future: SettleFuture,
}

#[derive(Default)]
struct SlotTable {
  state: CacheState,
  user_id: Option<String>,
  /// Bumped on every session change and clear
  epoch: u64,
  next_ticket: u64,
  /// Ticket of the newest result written per name
  applied: HashMap<CacheName, u64>,
  inflight: HashMap<CacheName, Inflight>,
  refreshes: HashMap<CacheName, JoinHandle<()>>,
  prefetch: Option<JoinHandle<()>>,
}

impl SlotTable {
  fn abort_tasks(&mut self) {
    for (_, handle) in self.refreshes.drain() {
      handle.abort();
    }
    if let Some(handle) = self.prefetch.take() {
      handle.abort();
    }
  }

  /// Make results of fetches started so far unable to overwrite `name`.
  /// Returns whether a fetch was in flight.
  fn supersede(&mut self, name: CacheName) -> bool {
    self.applied.insert(name, self.next_ticket);
    if let Some(handle) = self.refreshes.remove(&name) {
      handle.abort();
    }
    self.inflight.remove(&name).is_some()
  }

  fn reset(&mut self) {
    self.abort_tasks();
    self.inflight.clear();
    self.applied.clear();
    self.state = CacheState::default();
    self.epoch += 1;
  }

  fn refresh_running(&self, name: CacheName) -> bool {
    self
      .refreshes
      .get(&name)
      .map(|handle| !handle.is_finished())
      .unwrap_or(false)
  }
}

struct Inner {
  config: CacheConfig,
  queries: Arc<PaginatedQueryCache<HistoryItem>>,
  storage: Arc<StorageManager>,
  table: Mutex<SlotTable>,
  status: watch::Sender<CacheStatus>,
  search_results: watch::Sender<Vec<HistoryItem>>,
  refresh_throttles: HashMap<CacheName, Throttle<()>>,
  search: Debouncer<String>,
}

impl Inner {
  fn lock_table(&self) -> MutexGuard<'_, SlotTable> {
    self.table.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Image payloads stay out of the snapshot; history pages persisted by the
  /// query cache still carry them.
  fn persist_snapshot(&self, user_id: &str, state: &CacheState) {
    if !self
      .storage
      .set_item_safely(&snapshot_key(user_id), &state.without_images())
    {
      debug!(user = %user_id, "Cache snapshot not persisted");
    }
  }

  /// Write a finished fetch into its slot unless a newer result or a session
  /// change got there first.
  ///
  /// Only the newest fetch of a name updates its error flag, so a superseded
  /// failure can not mask a fetch still in flight.
  fn settle<S: NamedCache>(&self, ticket: u64, epoch: u64, result: Result<S::Value>) -> Result<(), String> {
    let (outcome, still_loading, error, snapshot) = {
      let mut table = self.lock_table();
      if table.epoch != epoch {
        debug!(cache = %S::NAME, "Dropping result from a previous session");
        return Ok(());
      }

      let current = table
        .inflight
        .get(&S::NAME)
        .map(|inflight| inflight.ticket == ticket)
        .unwrap_or(false);
      if current {
        table.inflight.remove(&S::NAME);
      }
      let still_loading = table.inflight.contains_key(&S::NAME);
      let applied = table.applied.get(&S::NAME).copied().unwrap_or(0);
      let newest = ticket > applied && !still_loading;

      match result {
        Ok(value) if ticket > applied => {
          *S::entry_mut(&mut table.state) = Some(CacheEntry::new(value));
          table.applied.insert(S::NAME, ticket);
          debug!(cache = %S::NAME, "Cache entry refreshed");
          let snapshot = table
            .user_id
            .clone()
            .map(|user| (user, table.state.clone()));
          (Ok(()), still_loading, Some(None), snapshot)
        }
        Ok(_) => {
          debug!(cache = %S::NAME, "Discarding superseded result");
          (Ok(()), still_loading, None, None)
        }
        Err(e) => {
          let message = e.to_string();
          if newest {
            warn!(cache = %S::NAME, error = %message, "Fetch failed");
            (Err(message.clone()), still_loading, Some(Some(message)), None)
          } else {
            debug!(cache = %S::NAME, error = %message, "Superseded fetch failed");
            (Err(message), still_loading, None, None)
          }
        }
      }
    };

    if let Some((user, state)) = snapshot {
      self.persist_snapshot(&user, &state);
    }

    self.status.send_modify(|status| {
      status.set_loading(S::NAME, still_loading);
      if let Some(error) = error {
        status.set_error(S::NAME, error);
      }
    });
    outcome
  }
}

/// Named caches for one signed-in user with stale-while-revalidate reads.
///
/// Reads never fail: they return the cached value, the freshly fetched
/// value, the last known value after a failed fetch, or a sample dataset.
/// Loading and error flags are published through [`subscribe`](Self::subscribe).
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct DataCache {
  inner: Arc<Inner>,
}

impl DataCache {
  pub fn new(remote: Arc<dyn RemoteStore>, storage: Arc<StorageManager>, config: &Config) -> Self {
    let queries = Arc::new(
      PaginatedQueryCache::new(remote)
        .with_storage(Arc::clone(&storage))
        .with_ttl(config.cache.ttl()),
    );

    let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
      let refresh_throttles = CacheName::ALL
        .into_iter()
        .map(|name| {
          let weak = weak.clone();
          let throttle = Throttle::new(config.rate_limit.refresh_throttle(), move |()| {
            if let Some(inner) = weak.upgrade() {
              DataCache { inner }.schedule_refresh_by_name(name);
            }
          });
          (name, throttle)
        })
        .collect();

      let search_weak = weak.clone();
      let search = Debouncer::new(config.rate_limit.search_debounce(), move |query: String| {
        if let Some(inner) = search_weak.upgrade() {
          DataCache { inner }.publish_search(&query);
        }
      });

      Inner {
        config: config.cache.clone(),
        queries,
        storage,
        table: Mutex::new(SlotTable::default()),
        status: watch::channel(CacheStatus::default()).0,
        search_results: watch::channel(Vec::new()).0,
        refresh_throttles,
        search,
      }
    });

    Self { inner }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Value of the cache `S`.
  ///
  /// Cached data is returned at once, even when stale; a stale entry also
  /// schedules one background refresh. Without data, or when forced, the
  /// fetch happens in this call.
  pub async fn get<S: NamedCache>(&self, force_refresh: bool) -> S::Value {
    self.get_with_source::<S>(force_refresh).await.data
  }

  /// Like [`get`](Self::get), reporting where the value came from.
  pub async fn get_with_source<S: NamedCache>(&self, force_refresh: bool) -> CacheResult<S::Value> {
    if !force_refresh {
      let cached = {
        let table = self.inner.lock_table();
        S::entry(&table.state)
          .filter(|entry| S::has_data(&entry.data))
          .map(|entry| {
            let stale = entry.is_stale(self.inner.config.ttl(), Utc::now());
            (entry.data.clone(), entry.timestamp, stale)
          })
      };

      if let Some((data, cached_at, stale)) = cached {
        if stale {
          debug!(cache = %S::NAME, "Serving stale entry");
          self.schedule_refresh::<S>();
        } else {
          debug!(cache = %S::NAME, "Cache hit");
        }
        return CacheResult::from_cache(data, cached_at, stale);
      }
      debug!(cache = %S::NAME, "Cache miss");
    }

    self.fetch::<S>(force_refresh).await
  }

  pub async fn get_history(&self, force_refresh: bool) -> Vec<HistoryItem> {
    self.get::<HistorySlot>(force_refresh).await
  }

  pub async fn get_analytics(&self, force_refresh: bool) -> Analytics {
    self.get::<AnalyticsSlot>(force_refresh).await
  }

  pub async fn get_user_stats(&self, force_refresh: bool) -> UserStats {
    self.get::<UserStatsSlot>(force_refresh).await
  }

  pub async fn get_recents(&self, force_refresh: bool) -> Vec<HistoryItem> {
    self.get::<RecentsSlot>(force_refresh).await
  }

  /// Fetch `S`, joining a fetch already in flight for the same name.
  async fn fetch<S: NamedCache>(&self, force: bool) -> CacheResult<S::Value> {
    let future = {
      let mut table = self.inner.lock_table();
      let existing = table
        .inflight
        .get(&S::NAME)
        .map(|inflight| inflight.future.clone());

      match (existing, table.user_id.clone()) {
        (Some(future), _) => {
          debug!(cache = %S::NAME, "Joining in-flight fetch");
          future
        }
        (None, Some(owner_id)) => {
          table.next_ticket += 1;
          let ticket = table.next_ticket;
          let epoch = table.epoch;

          let ctx = FetchContext {
            queries: Arc::clone(&self.inner.queries),
            owner_id,
            page_size: self.inner.config.page_size,
            recents_limit: self.inner.config.recents_limit,
            force,
          };
          let weak = Arc::downgrade(&self.inner);
          let future = async move {
            let result = S::fetch(ctx).await;
            match weak.upgrade() {
              Some(inner) => inner.settle::<S>(ticket, epoch, result),
              None => Ok(()),
            }
          }
          .boxed()
          .shared();

          table.inflight.insert(
            S::NAME,
            Inflight {
              ticket,
              future: future.clone(),
            },
          );
          self
            .inner
            .status
            .send_modify(|status| status.set_loading(S::NAME, true));
          future
        }
        (None, None) => {
          drop(table);
          warn!(cache = %S::NAME, "No active session, serving sample data");
          self.inner.status.send_modify(|status| {
            status.set_error(S::NAME, Some("No active session".to_string()))
          });
          return CacheResult::fallback(S::fallback());
        }
      }
    };

    let outcome = future.await;

    let table = self.inner.lock_table();
    match (S::entry(&table.state), outcome) {
      (Some(entry), Ok(())) => CacheResult::from_network(entry.data.clone()),
      (Some(entry), Err(_)) => CacheResult::offline(entry.data.clone(), entry.timestamp),
      (None, _) => CacheResult::fallback(S::fallback()),
    }
  }

  // ==========================================================================
  // Background refresh
  // ==========================================================================

  fn schedule_refresh<S: NamedCache>(&self) {
    let Ok(runtime) = Handle::try_current() else {
      debug!(cache = %S::NAME, "No runtime, background refresh skipped");
      return;
    };

    let mut table = self.inner.lock_table();
    if table.user_id.is_none() {
      return;
    }
    if table.refresh_running(S::NAME) {
      debug!(cache = %S::NAME, "Background refresh already running");
      return;
    }

    debug!(cache = %S::NAME, "Scheduling background refresh");
    let cache = self.clone();
    let handle = runtime.spawn(async move {
      cache.fetch::<S>(true).await;
    });
    table.refreshes.insert(S::NAME, handle);
  }

  fn schedule_refresh_by_name(&self, name: CacheName) {
    match name {
      CacheName::History => self.schedule_refresh::<HistorySlot>(),
      CacheName::Analytics => self.schedule_refresh::<AnalyticsSlot>(),
      CacheName::UserStats => self.schedule_refresh::<UserStatsSlot>(),
      CacheName::Recents => self.schedule_refresh::<RecentsSlot>(),
    }
  }

  /// Schedule a background refresh of `name` for a UI trigger.
  ///
  /// Triggers within the refresh throttle window of the last accepted one are
  /// dropped. Returns whether this trigger was accepted.
  pub fn request_refresh(&self, name: CacheName) -> bool {
    self
      .inner
      .refresh_throttles
      .get(&name)
      .map(|throttle| throttle.call(()))
      .unwrap_or(false)
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Apply a local change to the cached lists, then invalidate the aggregates
  /// derived from them and persist the snapshot.
  fn mutate(&self, apply: impl FnOnce(&mut CacheState) -> bool) -> bool {
    let (changed, snapshot) = {
      let mut table = self.inner.lock_table();
      let changed = apply(&mut table.state);
      for name in [CacheName::Analytics, CacheName::UserStats] {
        table.state.invalidate(name);
        table.supersede(name);
      }
      let snapshot = table
        .user_id
        .clone()
        .map(|user| (user, table.state.clone()));
      (changed, snapshot)
    };

    self.inner.status.send_modify(|status| {
      status.set_loading(CacheName::Analytics, false);
      status.set_loading(CacheName::UserStats, false);
    });

    if let Some((user, state)) = snapshot {
      self.inner.queries.invalidate_owner(&user);
      self.inner.persist_snapshot(&user, &state);
    }
    changed
  }

  /// Put a new record at the head of recents, and of history when cached.
  pub fn add_recent(&self, item: HistoryItem) {
    let limit = self.inner.config.recents_limit;
    debug!(id = %item.id, "Adding recent item");

    self.mutate(|state| {
      let recents = state.recents.get_or_insert_with(|| CacheEntry {
        data: Vec::new(),
        timestamp: Utc::now(),
        is_valid: false,
      });
      prepend(&mut recents.data, item.clone());
      recents.data.truncate(limit);

      if let Some(history) = state.history.as_mut() {
        prepend(&mut history.data, item);
      }
      true
    });
  }

  /// Remove a record from recents and history. Returns whether it was cached.
  pub fn remove_recent(&self, id: &str) -> bool {
    self.mutate(|state| {
      let mut removed = false;
      for entry in [state.recents.as_mut(), state.history.as_mut()]
        .into_iter()
        .flatten()
      {
        let before = entry.data.len();
        entry.data.retain(|item| item.id != id);
        removed |= entry.data.len() != before;
      }
      removed
    })
  }

  /// Merge `patch` into the cached copies of a record.
  pub fn update_recent(&self, id: &str, patch: &HistoryPatch) -> bool {
    self.mutate(|state| {
      let mut updated = false;
      for entry in [state.recents.as_mut(), state.history.as_mut()]
        .into_iter()
        .flatten()
      {
        for item in entry.data.iter_mut().filter(|item| item.id == id) {
          item.apply(patch);
          updated = true;
        }
      }
      updated
    })
  }

  /// Fetch one record again and replace its cached copies.
  ///
  /// A record that no longer exists is removed from the cached lists.
  pub async fn reload_item(&self, id: &str) -> Result<Option<HistoryItem>> {
    match self.inner.queries.fetch_one(id).await? {
      Some(fresh) => {
        self.mutate(|state| {
          let mut replaced = false;
          for entry in [state.recents.as_mut(), state.history.as_mut()]
            .into_iter()
            .flatten()
          {
            for item in entry.data.iter_mut().filter(|item| item.id == fresh.id) {
              *item = fresh.clone();
              replaced = true;
            }
          }
          replaced
        });
        Ok(Some(fresh))
      }
      None => {
        self.remove_recent(id);
        Ok(None)
      }
    }
  }

  /// Append the next history page. Returns the merged history.
  pub async fn load_more_history(&self) -> Vec<HistoryItem> {
    let (owner_id, epoch) = {
      let table = self.inner.lock_table();
      (table.user_id.clone(), table.epoch)
    };
    let Some(owner_id) = owner_id else {
      return Vec::new();
    };

    let shape = history_shape(&owner_id, self.inner.config.page_size);
    match self.inner.queries.load_more(&shape).await {
      Ok(view) => {
        let snapshot = {
          let mut table = self.inner.lock_table();
          if table.epoch != epoch {
            return view.records;
          }
          table.next_ticket += 1;
          let ticket = table.next_ticket;
          table.applied.insert(CacheName::History, ticket);
          table.state.history = Some(CacheEntry::new(view.records.clone()));
          table.state.clone()
        };
        self.inner.persist_snapshot(&owner_id, &snapshot);
        self
          .inner
          .status
          .send_modify(|status| status.set_error(CacheName::History, None));
        view.records
      }
      Err(e) => {
        warn!(error = %e, "Failed to load more history");
        self
          .inner
          .status
          .send_modify(|status| status.set_error(CacheName::History, Some(e.to_string())));
        self
          .inner
          .lock_table()
          .state
          .history
          .as_ref()
          .map(|entry| entry.data.clone())
          .unwrap_or_default()
      }
    }
  }

  /// Whether the server has history beyond the loaded pages.
  pub fn has_more_history(&self) -> bool {
    let Some(owner_id) = self.user_id() else {
      return false;
    };
    let shape = history_shape(&owner_id, self.inner.config.page_size);
    self
      .inner
      .queries
      .view(&shape)
      .map(|view| !view.exhausted)
      .unwrap_or(false)
  }

  // ==========================================================================
  // Invalidation
  // ==========================================================================

  /// Mark `name` stale without dropping its data. Results of fetches already
  /// in flight for it are discarded.
  pub fn invalidate(&self, name: CacheName) {
    let had_inflight = {
      let mut table = self.inner.lock_table();
      table.state.invalidate(name);
      table.supersede(name)
    };
    if had_inflight {
      self
        .inner
        .status
        .send_modify(|status| status.set_loading(name, false));
    }
    debug!(cache = %name, "Invalidated");
  }

  pub fn invalidate_all(&self) {
    for name in CacheName::ALL {
      self.invalidate(name);
    }
  }

  /// Drop every entry and the persisted snapshot, keeping the session.
  pub fn clear_all(&self) {
    let owner_id = {
      let mut table = self.inner.lock_table();
      table.reset();
      table.user_id.clone()
    };
    self.inner.status.send_replace(CacheStatus::default());

    if let Some(owner_id) = owner_id {
      self.inner.storage.remove_item(&snapshot_key(&owner_id));
      self.inner.queries.clear_owner(&owner_id);
    }
    info!("Cleared all caches");
  }

  // ==========================================================================
  // Session lifecycle
  // ==========================================================================

  /// Start a session for `user_id`, restoring its persisted snapshot.
  ///
  /// Stale or missing entries are refreshed in the background after the
  /// configured prefetch delay.
  pub fn start_session(&self, user_id: &str) {
    let current = self.inner.lock_table().user_id.clone();
    match current.as_deref() {
      Some(active) if active == user_id => {
        debug!(user = %user_id, "Session already active");
        return;
      }
      Some(_) => self.end_session(),
      None => {}
    }

    let key = snapshot_key(user_id);
    let state = match self.inner.storage.load_item::<CacheState>(&key) {
      Ok(Some(state)) => {
        info!(user = %user_id, "Restored cache snapshot");
        state
      }
      Ok(None) => {
        info!(user = %user_id, "No cache snapshot, starting cold");
        CacheState::default()
      }
      Err(e) => {
        warn!(user = %user_id, error = %e, "Discarding malformed cache snapshot");
        self.inner.storage.remove_item(&key);
        CacheState::default()
      }
    };
    let pending = state.needs_refresh(self.inner.config.ttl(), Utc::now());

    {
      let mut table = self.inner.lock_table();
      table.reset();
      table.state = state;
      table.user_id = Some(user_id.to_string());
    }
    self.inner.status.send_replace(CacheStatus::default());

    if self.inner.config.prefetch_on_sign_in && !pending.is_empty() {
      self.schedule_prefetch(pending);
    }
  }

  fn schedule_prefetch(&self, names: Vec<CacheName>) {
    let Ok(runtime) = Handle::try_current() else {
      debug!("No runtime, sign-in prefetch skipped");
      return;
    };

    let delay = self.inner.config.prefetch_delay();
    debug!(caches = ?names, ?delay, "Scheduling sign-in prefetch");
    let weak = Arc::downgrade(&self.inner);
    let handle = runtime.spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(inner) = weak.upgrade() {
        let cache = DataCache { inner };
        for name in names {
          cache.schedule_refresh_by_name(name);
        }
      }
    });

    if let Some(previous) = self.inner.lock_table().prefetch.replace(handle) {
      previous.abort();
    }
  }

  /// End the session: stop background work, drop every entry and delete the
  /// user's snapshot and persisted query pages.
  pub fn end_session(&self) {
    let owner_id = {
      let mut table = self.inner.lock_table();
      table.reset();
      table.user_id.take()
    };
    self.inner.search.cancel();
    self.inner.search_results.send_replace(Vec::new());
    self.inner.status.send_replace(CacheStatus::default());

    if let Some(owner_id) = owner_id {
      self.inner.storage.remove_item(&snapshot_key(&owner_id));
      self.inner.queries.clear_owner(&owner_id);
      info!(user = %owner_id, "Session ended");
    }
  }

  /// Follow identity changes until the event stream closes.
  pub async fn run_identity_events(&self, mut events: mpsc::Receiver<AuthEvent>) {
    while let Some(event) = events.recv().await {
      match event {
        AuthEvent::SignedIn(user_id) => self.start_session(&user_id),
        AuthEvent::SignedOut => self.end_session(),
      }
    }
    debug!("Identity event stream closed");
  }

  // ==========================================================================
  // Search
  // ==========================================================================

  /// Filter cached history by `query` once typing pauses.
  ///
  /// Results are published to [`subscribe_search`](Self::subscribe_search).
  pub fn search_history(&self, query: impl Into<String>) {
    self.inner.search.call(query.into());
  }

  pub fn subscribe_search(&self) -> watch::Receiver<Vec<HistoryItem>> {
    self.inner.search_results.subscribe()
  }

  fn publish_search(&self, query: &str) {
    let matches: Vec<HistoryItem> = self
      .inner
      .lock_table()
      .state
      .history
      .as_ref()
      .map(|entry| {
        entry
          .data
          .iter()
          .filter(|item| item.matches(query))
          .cloned()
          .collect()
      })
      .unwrap_or_default();

    debug!(query = %query, matches = matches.len(), "History search");
    self.inner.search_results.send_replace(matches);
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  /// Loading and error flags of every named cache.
  pub fn subscribe(&self) -> watch::Receiver<CacheStatus> {
    self.inner.status.subscribe()
  }

  pub fn is_loading(&self, name: CacheName) -> bool {
    self.inner.status.borrow().is_loading(name)
  }

  pub fn error(&self, name: CacheName) -> Option<String> {
    self.inner.status.borrow().error(name).map(str::to_string)
  }

  pub fn user_id(&self) -> Option<String> {
    self.inner.lock_table().user_id.clone()
  }

  /// Copy of the current cache state.
  pub fn snapshot(&self) -> CacheState {
    self.inner.lock_table().state.clone()
  }

  pub fn storage(&self) -> &Arc<StorageManager> {
    &self.inner.storage
  }
}

fn prepend(items: &mut Vec<HistoryItem>, item: HistoryItem) {
  items.retain(|existing| existing.id != item.id);
  items.insert(0, item);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::config::StorageConfig;
  use crate::records::{sample, AnalysisStatus, Severity, ANALYSES_COLLECTION};
  use crate::remote::{MemoryStore, Record};
  use crate::storage::MemoryBackend;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::time::Duration;

  fn analysis(i: usize, damage: &str) -> Record {
    let fields = json!({
      "userId": "u1",
      "timestamp": format!("2024-02-01T10:{:02}:00Z", i),
      "vehicleInfo": "2019 Civic",
      "damageType": damage,
      "severity": "moderate",
      "estimatedCost": 100.0,
      "status": "completed",
    });
    Record::new(format!("a{:02}", i), fields.as_object().cloned().unwrap())
  }

  fn store(count: usize) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    for i in 0..count {
      store.insert(ANALYSES_COLLECTION, analysis(i, "Dent")).unwrap();
    }
    Arc::new(store)
  }

  fn slow_store(count: usize, latency: Duration) -> Arc<MemoryStore> {
    let store = MemoryStore::new().with_latency(latency);
    for i in 0..count {
      store.insert(ANALYSES_COLLECTION, analysis(i, "Dent")).unwrap();
    }
    Arc::new(store)
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

  fn config(ttl_secs: u64) -> Config {
    let mut config = Config::default();
    config.cache.ttl_secs = ttl_secs;
    config.cache.prefetch_on_sign_in = false;
    config
  }

  fn session(store: &Arc<MemoryStore>, storage: &Arc<StorageManager>, config: &Config) -> DataCache {
    let cache = DataCache::new(store.clone(), storage.clone(), config);
    cache.start_session("u1");
    cache
  }

  fn item(id: &str) -> HistoryItem {
    HistoryItem {
      id: id.to_string(),
      owner_id: "u1".to_string(),
      created_at: Utc::now(),
      vehicle: None,
      damage_type: "Scratch".to_string(),
      severity: Severity::Minor,
      estimated_cost: 50.0,
      status: AnalysisStatus::Pending,
      image: None,
    }
  }

  #[tokio::test]
  async fn test_concurrent_gets_share_one_fetch() {
    let store = slow_store(5, Duration::from_millis(20));
    let cache = session(&store, &storage(), &config(300));

    let (a, b) = tokio::join!(cache.get_history(false), cache.get_history(false));
    assert_eq!(a, b);
    assert_eq!(a.len(), 5);
    assert_eq!(store.query_count(), 1);
    assert!(!cache.is_loading(CacheName::History));
  }

  #[tokio::test]
  async fn test_fresh_entry_triggers_no_refresh() {
    let store = store(5);
    let cache = session(&store, &storage(), &config(300));

    cache.get_history(false).await;
    let result = cache.get_with_source::<HistorySlot>(false).await;
    assert_eq!(result.source, CacheSource::CacheFresh);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.query_count(), 1);
  }

  #[tokio::test]
  async fn test_stale_entry_served_with_one_background_refresh() {
    let store = slow_store(5, Duration::from_millis(10));
    let cache = session(&store, &storage(), &config(0));

    assert_eq!(cache.get_history(false).await.len(), 5);
    store.insert(ANALYSES_COLLECTION, analysis(30, "Dent")).unwrap();

    let first = cache.get_with_source::<HistorySlot>(false).await;
    let second = cache.get_with_source::<HistorySlot>(false).await;
    assert_eq!(first.source, CacheSource::CacheStale);
    assert_eq!(first.data.len(), 5);
    assert_eq!(second.data.len(), 5);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.query_count(), 2);
    assert_eq!(cache.snapshot().history.unwrap().data.len(), 6);
  }

  #[tokio::test]
  async fn test_forced_get_fetches_in_call() {
    let store = store(5);
    let cache = session(&store, &storage(), &config(300));

    cache.get_history(false).await;
    store.insert(ANALYSES_COLLECTION, analysis(30, "Dent")).unwrap();

    let result = cache.get_with_source::<HistorySlot>(true).await;
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 6);
    assert_eq!(result.data[0].id, "a30");
  }

  #[tokio::test]
  async fn test_invalidate_twice_equals_once() {
    let store = store(5);
    let cache = session(&store, &storage(), &config(300));
    cache.get_analytics(false).await;

    cache.invalidate(CacheName::Analytics);
    let once = cache.snapshot();
    cache.invalidate(CacheName::Analytics);
    assert_eq!(cache.snapshot(), once);

    let analytics = once.analytics.unwrap();
    assert!(!analytics.is_valid);
    assert_eq!(analytics.data.total_analyses, 5);
  }

  #[tokio::test]
  async fn test_add_recent_cross_invalidates_aggregates() {
    let store = store(5);
    let cache = session(&store, &storage(), &config(300));
    cache.get_recents(false).await;
    cache.get_history(false).await;
    cache.get_analytics(false).await;
    cache.get_user_stats(false).await;

    cache.add_recent(item("new"));

    let state = cache.snapshot();
    assert_eq!(state.recents.as_ref().unwrap().data[0].id, "new");
    assert_eq!(state.history.as_ref().unwrap().data[0].id, "new");
    assert!(!state.analytics.unwrap().is_valid);
    assert!(!state.user_stats.unwrap().is_valid);
    assert!(state.recents.unwrap().is_valid);
  }

  #[tokio::test]
  async fn test_recents_stay_bounded_and_deduplicated() {
    let store = store(0);
    let cache = session(&store, &storage(), &config(300));

    for i in 0..12 {
      cache.add_recent(item(&format!("r{}", i)));
    }
    cache.add_recent(item("r5"));

    let recents = cache.snapshot().recents.unwrap().data;
    assert_eq!(recents.len(), 10);
    assert_eq!(recents[0].id, "r5");
    assert_eq!(recents.iter().filter(|i| i.id == "r5").count(), 1);
  }

  #[tokio::test]
  async fn test_update_and_remove_recent() {
    let store = store(3);
    let cache = session(&store, &storage(), &config(300));
    cache.get_recents(false).await;
    cache.get_history(false).await;

    let patch = HistoryPatch {
      status: Some(AnalysisStatus::Failed),
      ..Default::default()
    };
    assert!(cache.update_recent("a01", &patch));
    let state = cache.snapshot();
    for list in [state.recents.unwrap().data, state.history.unwrap().data] {
      let updated = list.iter().find(|i| i.id == "a01").unwrap();
      assert_eq!(updated.status, AnalysisStatus::Failed);
    }

    assert!(cache.remove_recent("a01"));
    assert!(!cache.remove_recent("a01"));
    let state = cache.snapshot();
    assert!(state.recents.unwrap().data.iter().all(|i| i.id != "a01"));
    assert!(state.history.unwrap().data.iter().all(|i| i.id != "a01"));
  }

  #[tokio::test]
  async fn test_failed_refresh_keeps_previous_data() {
    let store = store(5);
    let cache = session(&store, &storage(), &config(300));
    let before = cache.get_history(false).await;

    store.set_available(false);
    let result = cache.get_with_source::<HistorySlot>(true).await;
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, before);
    assert!(cache.error(CacheName::History).is_some());

    store.set_available(true);
    cache.get_history(true).await;
    assert!(cache.error(CacheName::History).is_none());
  }

  #[tokio::test]
  async fn test_failure_without_data_serves_fallback() {
    let store = store(5);
    store.set_available(false);
    let cache = session(&store, &storage(), &config(300));

    let result = cache.get_with_source::<AnalyticsSlot>(false).await;
    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data, sample::sample_analytics());
    assert!(cache.error(CacheName::Analytics).is_some());
  }

  #[tokio::test]
  async fn test_snapshot_restores_next_session() {
    let store = store(5);
    let storage = storage();
    let config = config(300);

    session(&store, &storage, &config).get_history(false).await;
    assert_eq!(store.query_count(), 1);

    let restored = session(&store, &storage, &config);
    assert_eq!(restored.get_history(false).await.len(), 5);
    assert_eq!(store.query_count(), 1);
  }

  #[tokio::test]
  async fn test_malformed_snapshot_starts_cold() {
    let store = store(2);
    let storage = storage();
    assert!(storage.set_item_safely(&snapshot_key("u1"), "not a cache state"));

    let cache = session(&store, &storage, &config(300));
    assert_eq!(cache.snapshot(), CacheState::default());
    assert!(storage.list_items().is_empty());
    assert_eq!(cache.get_history(false).await.len(), 2);
  }

  #[tokio::test]
  async fn test_end_session_clears_everything() {
    let store = store(5);
    let storage = storage();
    let cache = session(&store, &storage, &config(300));
    cache.get_history(false).await;
    assert!(storage
      .list_items()
      .iter()
      .any(|i| i.key == snapshot_key("u1")));

    cache.end_session();
    assert_eq!(cache.user_id(), None);
    assert_eq!(cache.snapshot(), CacheState::default());
    assert!(storage.list_items().is_empty());
  }

  #[tokio::test]
  async fn test_result_from_before_sign_out_is_discarded() {
    let store = slow_store(5, Duration::from_millis(50));
    let cache = session(&store, &storage(), &config(300));

    let pending = tokio::spawn({
      let cache = cache.clone();
      async move { cache.get_with_source::<HistorySlot>(false).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.end_session();

    let result = pending.await.unwrap();
    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(cache.snapshot(), CacheState::default());
  }

  #[tokio::test]
  async fn test_invalidate_discards_inflight_result() {
    let store = store(5);
    let cache = session(&store, &storage(), &config(300));
    cache.get_history(false).await;
    store.insert(ANALYSES_COLLECTION, analysis(30, "Dent")).unwrap();
    store.set_latency(Duration::from_millis(50));

    let pending = tokio::spawn({
      let cache = cache.clone();
      async move { cache.get_history(true).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.is_loading(CacheName::History));

    cache.invalidate(CacheName::History);
    assert!(!cache.is_loading(CacheName::History));

    pending.await.unwrap();
    let history = cache.snapshot().history.unwrap();
    assert_eq!(history.data.len(), 5);
    assert!(!history.is_valid);
    assert!(!cache.is_loading(CacheName::History));
  }

  #[test]
  fn test_older_result_never_overwrites_newer() {
    let store = store(0);
    let cache = session(&store, &storage(), &config(300));
    let (older, newer, epoch) = {
      let mut table = cache.inner.lock_table();
      table.next_ticket += 2;
      (table.next_ticket - 1, table.next_ticket, table.epoch)
    };

    cache
      .inner
      .settle::<HistorySlot>(newer, epoch, Ok(vec![item("newer")]))
      .unwrap();
    cache
      .inner
      .settle::<HistorySlot>(older, epoch, Ok(vec![item("older")]))
      .unwrap();
    let history = cache.snapshot().history.unwrap().data;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, "newer");

    // A late failure of the older fetch leaves the status of the newer one.
    let late = cache
      .inner
      .settle::<HistorySlot>(older, epoch, Err(eyre!("timed out")));
    assert!(late.is_err());
    assert!(cache.error(CacheName::History).is_none());
  }

  #[tokio::test]
  async fn test_snapshot_leaves_out_image_payloads() {
    let store = store(1);
    let mut record = analysis(5, "Dent");
    record
      .fields
      .insert("image".to_string(), json!("x".repeat(1_100_000)));
    store.insert(ANALYSES_COLLECTION, record).unwrap();
    let storage = storage();
    let cache = session(&store, &storage, &config(300));

    let history = cache.get_history(false).await;
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|i| i.image.is_some()));

    let persisted: CacheState = storage.load_item(&snapshot_key("u1")).unwrap().unwrap();
    let persisted = persisted.history.unwrap().data;
    assert_eq!(persisted.len(), 2);
    assert!(persisted.iter().all(|i| i.image.is_none()));
  }

  #[test]
  fn test_search_without_runtime_does_not_panic() {
    let store = store(3);
    let cache = session(&store, &storage(), &config(300));

    cache.search_history("dent");
    assert!(cache.subscribe_search().borrow().is_empty());
    cache.end_session();
  }

  #[tokio::test]
  async fn test_clear_all_keeps_session() {
    let store = store(5);
    let storage = storage();
    let cache = session(&store, &storage, &config(300));
    cache.get_history(false).await;

    cache.clear_all();
    assert_eq!(cache.user_id().as_deref(), Some("u1"));
    assert!(cache.snapshot().history.is_none());
    assert!(storage.list_items().is_empty());

    cache.get_history(false).await;
    assert_eq!(store.query_count(), 2);
  }

  #[tokio::test]
  async fn test_load_more_history() {
    let store = store(25);
    let cache = session(&store, &storage(), &config(300));

    assert_eq!(cache.get_history(false).await.len(), 20);
    assert!(cache.has_more_history());

    assert_eq!(cache.load_more_history().await.len(), 25);
    assert!(!cache.has_more_history());
    assert_eq!(cache.snapshot().history.unwrap().data.len(), 25);
  }

  #[tokio::test]
  async fn test_reload_item_replaces_cached_copy() {
    let store = store(3);
    let cache = session(&store, &storage(), &config(300));
    cache.get_recents(false).await;

    store.insert(ANALYSES_COLLECTION, analysis(1, "Scratch")).unwrap();
    let fresh = cache.reload_item("a01").await.unwrap().unwrap();
    assert_eq!(fresh.damage_type, "Scratch");
    assert_eq!(store.lookup_count(), 1);
    assert_eq!(store.query_count(), 1);

    let recents = cache.snapshot().recents.unwrap().data;
    assert_eq!(
      recents.iter().find(|i| i.id == "a01").unwrap().damage_type,
      "Scratch"
    );
    assert!(cache.reload_item("gone").await.unwrap().is_none());
    assert_eq!(store.lookup_count(), 2);
  }

  #[tokio::test]
  async fn test_get_without_session_serves_fallback() {
    let store = store(5);
    let cache = DataCache::new(store.clone(), storage(), &config(300));

    let result = cache.get_with_source::<RecentsSlot>(false).await;
    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(store.query_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_request_refresh_is_throttled() {
    let store = store(5);
    let cache = session(&store, &storage(), &config(300));

    assert!(cache.request_refresh(CacheName::History));
    assert!(!cache.request_refresh(CacheName::History));
    assert!(cache.request_refresh(CacheName::Recents));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(cache.request_refresh(CacheName::History));
  }

  #[tokio::test(start_paused = true)]
  async fn test_search_history_is_debounced() {
    let store = store(3);
    store.insert(ANALYSES_COLLECTION, analysis(9, "Scratch")).unwrap();
    let cache = session(&store, &storage(), &config(300));
    cache.get_history(false).await;

    let results = cache.subscribe_search();
    cache.search_history("scr");
    cache.search_history("scra");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(results.borrow().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let matches = results.borrow().clone();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, "a09");
  }

  #[tokio::test(start_paused = true)]
  async fn test_sign_in_prefetches_missing_entries() {
    let store = store(5);
    let mut config = config(300);
    config.cache.prefetch_on_sign_in = true;
    let cache = session(&store, &storage(), &config);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.query_count(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let state = cache.snapshot();
    assert!(state.history.is_some());
    assert!(state.analytics.is_some());
    assert!(state.user_stats.is_some());
    assert!(state.recents.is_some());
  }

  #[tokio::test]
  async fn test_identity_events_drive_session() {
    let store = store(2);
    let cache = DataCache::new(store.clone(), storage(), &config(300));
    let (tx, rx) = mpsc::channel(4);
    let task = tokio::spawn({
      let cache = cache.clone();
      async move { cache.run_identity_events(rx).await }
    });

    tx.send(AuthEvent::SignedIn("u1".to_string())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.user_id().as_deref(), Some("u1"));

    tx.send(AuthEvent::SignedOut).await.unwrap();
    drop(tx);
    task.await.unwrap();
    assert_eq!(cache.user_id(), None);
  }
}
