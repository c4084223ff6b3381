//! What the store needs from an entity, and how a read reports its origin.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// A server entity the store can mirror.
///
/// The server assigns the key; the client never mints one. Two writes with
/// the same key replace each other, the later one wins.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  fn cache_key(&self) -> String;

  /// RFC 3339 modification time, the high-water mark for `updated_since`
  /// requests. `None` makes every sync of the type a full one.
  fn updated_at(&self) -> Option<&str>;

  /// Table tag in the store, and the `type` of pushed socket frames.
  fn entity_type() -> &'static str;
}

/// Data handed back by the sync layer, tagged with where it came from so a
/// screen can show an "offline" banner.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Last successful sync of the data; `None` when it just came off the wire
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// The server could not be reached (or refused), so the last synced copy
  /// is served instead.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched during this call
  Network,
  /// Store copy within the freshness window, no request made
  CacheFresh,
  /// Store copy served because the request failed
  Offline,
}
