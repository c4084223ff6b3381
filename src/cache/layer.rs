//! Sync layer: cache-first REST refresh plus upsert-on-receive for pushed
//! socket frames.

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::error::{ApiError, ApiResult};
use crate::model::{Agency, CodeList, Facility, Patient, Responder, Scene};

use super::resource::Resource;
use super::storage::Store;
use super::traits::{CacheResult, Cacheable};

/// Outcome of applying one pushed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
  Upserted { entity_type: String, count: usize },
  Deleted { entity_type: String, count: usize },
  /// Not an entity frame, or an entity type this client doesn't mirror
  Ignored,
}

/// Sits between consumers and the network client: every fetch lands in the
/// store, and reads fall back to the store when the network fails.
pub struct SyncLayer {
  client: ApiClient,
  store: Arc<Store>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl SyncLayer {
  pub fn new(client: ApiClient, store: Arc<Store>) -> Self {
    Self {
      client,
      store,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn store(&self) -> &Arc<Store> {
    &self.store
  }

  pub fn client(&self) -> &ApiClient {
    &self.client
  }

  /// Check if cached data is stale based on its sync timestamp.
  fn is_stale(&self, cached_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.stale_time
  }

  /// Fetch a collection with a cache-first strategy.
  ///
  /// 1. Fresh cached result: return it
  /// 2. Otherwise fetch every page and replace the cached result
  /// 3. On network failure, return the stale cache (offline mode)
  pub async fn refresh<T: Cacheable>(&self, resource: &Resource) -> ApiResult<CacheResult<Vec<T>>> {
    let key = resource.cache_hash();

    if let Some(cached) = self.store.get_resource::<T>(&key)? {
      if !self.is_stale(cached.synced_at) {
        return Ok(CacheResult::from_cache(cached.entities, cached.synced_at));
      }

      match self.fetch_all::<T>(resource, None).await {
        Ok(data) => {
          self.store.store_resource(&key, &resource.description(), &data)?;
          Ok(CacheResult::from_network(data))
        }
        Err(e) => {
          warn!(resource = %resource.description(), error = %e, "refresh failed, serving cache");
          Ok(CacheResult::offline(cached.entities, cached.synced_at))
        }
      }
    } else {
      let data = self.fetch_all::<T>(resource, None).await?;
      self.store.store_resource(&key, &resource.description(), &data)?;
      Ok(CacheResult::from_network(data))
    }
  }

  /// Fetch regardless of freshness. Errors are returned unmodified; the
  /// cached result is left untouched on failure.
  pub async fn force_refresh<T: Cacheable>(&self, resource: &Resource) -> ApiResult<Vec<T>> {
    let data = self.fetch_all::<T>(resource, None).await?;
    self
      .store
      .store_resource(&resource.cache_hash(), &resource.description(), &data)?;
    Ok(data)
  }

  /// Fetch with incremental update support.
  ///
  /// When a previous sync recorded a max updated_at, only records updated
  /// since then are requested (`updated_since=`) and merged into the cache.
  /// A fresh cached result is served without a request.
  pub async fn refresh_incremental<T: Cacheable>(
    &self,
    resource: &Resource,
  ) -> ApiResult<CacheResult<Vec<T>>> {
    self.incremental(resource, false).await
  }

  /// Incremental fetch that always asks the server, however fresh the cache.
  ///
  /// Used to catch up after a reconnect or dropped pushes. Failures still
  /// fall back to the cached result when there is one.
  pub async fn sync_incremental<T: Cacheable>(
    &self,
    resource: &Resource,
  ) -> ApiResult<CacheResult<Vec<T>>> {
    self.incremental(resource, true).await
  }

  async fn incremental<T: Cacheable>(
    &self,
    resource: &Resource,
    force: bool,
  ) -> ApiResult<CacheResult<Vec<T>>> {
    let key = resource.cache_hash();
    let max_updated = self.store.resource_max_updated(&key)?;

    if let Some(cached) = self.store.get_resource::<T>(&key)? {
      if !force && !self.is_stale(cached.synced_at) {
        return Ok(CacheResult::from_cache(cached.entities, cached.synced_at));
      }

      match self.fetch_all::<T>(resource, max_updated.as_deref()).await {
        Ok(delta) => {
          if delta.is_empty() {
            // Nothing new; bump the sync timestamp only
            self
              .store
              .store_resource(&key, &resource.description(), &cached.entities)?;
            return Ok(CacheResult::from_cache(cached.entities, Utc::now()));
          }

          debug!(resource = %resource.description(), count = delta.len(), "merging delta");
          let merged = self
            .store
            .merge_resource(&key, &resource.description(), &delta)?;
          Ok(CacheResult::from_network(merged))
        }
        Err(e) => {
          warn!(resource = %resource.description(), error = %e, "incremental refresh failed, serving cache");
          Ok(CacheResult::offline(cached.entities, cached.synced_at))
        }
      }
    } else {
      let data = self.fetch_all::<T>(resource, None).await?;
      self.store.store_resource(&key, &resource.description(), &data)?;
      Ok(CacheResult::from_network(data))
    }
  }

  /// Fetch a single entity with caching.
  pub async fn fetch_one<T: Cacheable>(&self, path: &str, key: &str) -> ApiResult<CacheResult<T>> {
    if let Some(cached) = self.store.get::<T>(key)? {
      if !self.is_stale(cached.cached_at) {
        return Ok(CacheResult::from_cache(cached.entity, cached.cached_at));
      }

      match self.client.get_json::<T>(path).await {
        Ok(data) => {
          self.store.upsert_one(&data)?;
          Ok(CacheResult::from_network(data))
        }
        Err(ApiError::NotFound) => {
          // Gone on the server; drop the local copy too
          self.store.delete::<T>(key)?;
          Err(ApiError::NotFound)
        }
        Err(e) => {
          warn!(path, error = %e, "fetch failed, serving cache");
          Ok(CacheResult::offline(cached.entity, cached.cached_at))
        }
      }
    } else {
      let data = self.client.get_json::<T>(path).await?;
      self.store.upsert_one(&data)?;
      Ok(CacheResult::from_network(data))
    }
  }

  async fn fetch_all<T: DeserializeOwned>(
    &self,
    resource: &Resource,
    updated_since: Option<&str>,
  ) -> ApiResult<Vec<T>> {
    let mut query = resource.query_pairs();
    if let Some(since) = updated_since {
      query.push(("updated_since", since));
    }
    self.client.get_all::<T>(&resource.path, &query).await
  }

  /// Apply one frame pushed over the live socket.
  ///
  /// Frames look like `{"type": "patient", "data": {...} | [...]}` with an
  /// optional `"action": "destroy"` (or `"delete"`). Anything else is ignored.
  pub fn apply_push(&self, frame: &Value) -> ApiResult<Applied> {
    let (entity_type, data) = match (
      frame.get("type").and_then(Value::as_str),
      frame.get("data"),
    ) {
      (Some(t), Some(d)) => (t, d),
      _ => {
        debug!("ignoring frame without type/data");
        return Ok(Applied::Ignored);
      }
    };
    let destroy = matches!(
      frame.get("action").and_then(Value::as_str),
      Some("destroy") | Some("delete")
    );

    match entity_type {
      "agency" => self.apply::<Agency>(data, destroy),
      "facility" => self.apply::<Facility>(data, destroy),
      "scene" => self.apply::<Scene>(data, destroy),
      "responder" => self.apply::<Responder>(data, destroy),
      "patient" => self.apply::<Patient>(data, destroy),
      "code_list" => self.apply::<CodeList>(data, destroy),
      other => {
        debug!(entity_type = other, "ignoring frame for unmirrored type");
        Ok(Applied::Ignored)
      }
    }
  }

  fn apply<T: Cacheable>(&self, data: &Value, destroy: bool) -> ApiResult<Applied> {
    let records = match data {
      Value::Array(items) => items.clone(),
      other => vec![other.clone()],
    };
    let entity_type = T::entity_type().to_string();

    if destroy {
      let mut count = 0;
      for record in &records {
        let id = match record.get("id") {
          Some(Value::String(s)) => s.clone(),
          Some(Value::Number(n)) => n.to_string(),
          _ => continue,
        };
        if self.store.delete::<T>(&id)? {
          count += 1;
        }
      }
      info!(entity_type = %entity_type, count, "applied pushed delete");
      return Ok(Applied::Deleted { entity_type, count });
    }

    let entities: Vec<T> = records
      .into_iter()
      .map(serde_json::from_value)
      .collect::<Result<_, _>>()?;
    self.store.upsert(&entities)?;
    debug!(entity_type = %entity_type, count = entities.len(), "applied pushed upsert");

    Ok(Applied::Upserted {
      entity_type,
      count: entities.len(),
    })
  }
}
