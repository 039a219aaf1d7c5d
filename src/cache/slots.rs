//! The four named caches and how each one is fetched.

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use super::entry::{CacheEntry, CacheName, CacheState};
use crate::query::{PaginatedQueryCache, QueryShape, QueryView};
use crate::records::{
  aggregate_shape, history_shape, recents_shape, sample, Analytics, HistoryItem, UserStats,
};

/// Everything a slot needs to fetch its value.
#[derive(Clone)]
pub struct FetchContext {
  pub queries: Arc<PaginatedQueryCache<HistoryItem>>,
  pub owner_id: String,
  pub page_size: usize,
  pub recents_limit: usize,
  /// Bypass cached pages and go to the remote store
  pub force: bool,
}

impl FetchContext {
  async fn view(&self, shape: &QueryShape) -> Result<QueryView<HistoryItem>> {
    if self.force {
      self.queries.refresh(shape).await
    } else {
      self.queries.load(shape).await
    }
  }
}

/// A named cache slot of [`CacheState`].
///
/// Implemented by marker types so `DataCache::get::<S>()` resolves the entry,
/// the fetch and the fallback of one name statically.
pub trait NamedCache: Send + Sync + 'static {
  type Value: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;

  const NAME: CacheName;

  fn entry(state: &CacheState) -> Option<&CacheEntry<Self::Value>>;

  fn entry_mut(state: &mut CacheState) -> &mut Option<CacheEntry<Self::Value>>;

  /// Whether a cached value is worth serving without a fetch.
  fn has_data(value: &Self::Value) -> bool;

  /// Sample value served when nothing is cached and the fetch failed.
  fn fallback() -> Self::Value;

  fn fetch(ctx: FetchContext) -> BoxFuture<'static, Result<Self::Value>>;
}

pub struct HistorySlot;
pub struct AnalyticsSlot;
pub struct UserStatsSlot;
pub struct RecentsSlot;

impl NamedCache for HistorySlot {
  type Value = Vec<HistoryItem>;
  const NAME: CacheName = CacheName::History;

  fn entry(state: &CacheState) -> Option<&CacheEntry<Self::Value>> {
    state.history.as_ref()
  }

  fn entry_mut(state: &mut CacheState) -> &mut Option<CacheEntry<Self::Value>> {
    &mut state.history
  }

  fn has_data(value: &Self::Value) -> bool {
    !value.is_empty()
  }

  fn fallback() -> Self::Value {
    sample::sample_history()
  }

  fn fetch(ctx: FetchContext) -> BoxFuture<'static, Result<Self::Value>> {
    async move {
      let shape = history_shape(&ctx.owner_id, ctx.page_size);
      Ok(ctx.view(&shape).await?.records)
    }
    .boxed()
  }
}

impl NamedCache for AnalyticsSlot {
  type Value = Analytics;
  const NAME: CacheName = CacheName::Analytics;

  fn entry(state: &CacheState) -> Option<&CacheEntry<Self::Value>> {
    state.analytics.as_ref()
  }

  fn entry_mut(state: &mut CacheState) -> &mut Option<CacheEntry<Self::Value>> {
    &mut state.analytics
  }

  fn has_data(value: &Self::Value) -> bool {
    value.total_analyses > 0
  }

  fn fallback() -> Self::Value {
    sample::sample_analytics()
  }

  fn fetch(ctx: FetchContext) -> BoxFuture<'static, Result<Self::Value>> {
    async move {
      let view = ctx.view(&aggregate_shape(&ctx.owner_id)).await?;
      Ok(Analytics::from_items(&view.records))
    }
    .boxed()
  }
}

impl NamedCache for UserStatsSlot {
  type Value = UserStats;
  const NAME: CacheName = CacheName::UserStats;

  fn entry(state: &CacheState) -> Option<&CacheEntry<Self::Value>> {
    state.user_stats.as_ref()
  }

  fn entry_mut(state: &mut CacheState) -> &mut Option<CacheEntry<Self::Value>> {
    &mut state.user_stats
  }

  fn has_data(value: &Self::Value) -> bool {
    value.total_analyses > 0
  }

  fn fallback() -> Self::Value {
    sample::sample_user_stats()
  }

  fn fetch(ctx: FetchContext) -> BoxFuture<'static, Result<Self::Value>> {
    async move {
      let view = ctx.view(&aggregate_shape(&ctx.owner_id)).await?;
      Ok(UserStats::from_items(&view.records))
    }
    .boxed()
  }
}

impl NamedCache for RecentsSlot {
  type Value = Vec<HistoryItem>;
  const NAME: CacheName = CacheName::Recents;

  fn entry(state: &CacheState) -> Option<&CacheEntry<Self::Value>> {
    state.recents.as_ref()
  }

  fn entry_mut(state: &mut CacheState) -> &mut Option<CacheEntry<Self::Value>> {
    &mut state.recents
  }

  fn has_data(value: &Self::Value) -> bool {
    !value.is_empty()
  }

  fn fallback() -> Self::Value {
    sample::sample_history()
  }

  fn fetch(ctx: FetchContext) -> BoxFuture<'static, Result<Self::Value>> {
    async move {
      let shape = recents_shape(&ctx.owner_id, ctx.recents_limit);
      let mut records = ctx.view(&shape).await?.records;
      records.truncate(ctx.recents_limit);
      Ok(records)
    }
    .boxed()
  }
}
