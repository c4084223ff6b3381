//! SQLite-backed object store with change notifications.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ApiResult;

use super::predicate::{Filter, Predicate};
use super::traits::Cacheable;

/// Capacity of the change channel; slow subscribers observe a lag and re-query.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A single stored entity.
#[derive(Debug, Clone)]
pub struct Stored<T> {
  pub entity: T,
  /// When the entity was last written locally
  pub cached_at: DateTime<Utc>,
}

/// Entities last fetched for a resource, in server order.
#[derive(Debug, Clone)]
pub struct CachedResource<T> {
  pub entities: Vec<T>,
  pub synced_at: DateTime<Utc>,
  /// Maximum updated_at seen, for incremental fetching
  pub max_updated: Option<String>,
}

/// A query row: primary key, JSON form and decoded entity.
#[derive(Debug, Clone)]
pub struct Record<T> {
  pub key: String,
  pub value: Value,
  pub entity: T,
}

/// Published after every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
  pub entity_type: String,
  pub keys: Vec<String>,
}

/// Embedded object store mirroring server entities.
///
/// Writes are "insert or replace by primary key". Every committed write is
/// broadcast to subscribers, which is what keeps live queries current.
pub struct Store {
  conn: Mutex<Connection>,
  changes: broadcast::Sender<StoreChange>,
}

/// Schema for the store tables.
const STORE_SCHEMA: &str = r#"
-- Mirrored entities (serialized JSON)
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_entities_updated
    ON entities(entity_type, updated_at);

-- Fetched REST resources
CREATE TABLE IF NOT EXISTS resources (
    resource_key TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    max_updated TEXT,
    synced_at TEXT NOT NULL DEFAULT (datetime('now')),
    result_count INTEGER NOT NULL
);

-- Resource to entity mapping (preserves server order)
CREATE TABLE IF NOT EXISTS resource_entities (
    resource_key TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (resource_key, entity_key),
    FOREIGN KEY (resource_key) REFERENCES resources(resource_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_resource_entities_key ON resource_entities(resource_key);
"#;

impl Store {
  /// Open (or create) the store file at `path`.
  pub fn open(path: &Path) -> ApiResult<Self> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      if let Err(e) = std::fs::create_dir_all(parent) {
        warn!(path = %parent.display(), error = %e, "failed to create store directory");
      }
    }
    Self::with_connection(Connection::open(path)?)
  }

  /// Non-persistent store.
  pub fn open_in_memory() -> ApiResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> ApiResult<Self> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(STORE_SCHEMA)?;
    let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

    Ok(Self {
      conn: Mutex::new(conn),
      changes,
    })
  }

  fn conn(&self) -> MutexGuard<'_, Connection> {
    // A panic mid-write leaves SQLite consistent (the transaction rolls back),
    // so a poisoned lock is still usable.
    self.conn.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Subscribe to committed writes.
  pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
    self.changes.subscribe()
  }

  fn notify(&self, entity_type: &str, keys: Vec<String>) {
    if keys.is_empty() {
      return;
    }
    debug!(entity_type, count = keys.len(), "store changed");
    // No subscribers is fine
    let _ = self.changes.send(StoreChange {
      entity_type: entity_type.to_string(),
      keys,
    });
  }

  /// Insert or replace each entity by primary key, in one transaction.
  pub fn upsert<T: Cacheable>(&self, entities: &[T]) -> ApiResult<()> {
    if entities.is_empty() {
      return Ok(());
    }

    let keys = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      let keys = write_entities(&tx, entities)?;
      tx.commit()?;
      keys
    };

    self.notify(T::entity_type(), keys);
    Ok(())
  }

  pub fn upsert_one<T: Cacheable>(&self, entity: &T) -> ApiResult<()> {
    self.upsert(std::slice::from_ref(entity))
  }

  /// Delete by primary key. Returns whether a row existed.
  pub fn delete<T: Cacheable>(&self, key: &str) -> ApiResult<bool> {
    let removed = {
      let conn = self.conn();
      conn.execute(
        "DELETE FROM resource_entities WHERE entity_key = ?1
           AND resource_key IN (SELECT resource_key FROM resources WHERE entity_type = ?2)",
        params![key, T::entity_type()],
      )?;
      conn.execute(
        "DELETE FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
        params![T::entity_type(), key],
      )?
    };

    if removed > 0 {
      self.notify(T::entity_type(), vec![key.to_string()]);
    }
    Ok(removed > 0)
  }

  /// A single entity by key. A row that no longer decodes reads as absent.
  pub fn get<T: Cacheable>(&self, key: &str) -> ApiResult<Option<Stored<T>>> {
    let conn = self.conn();
    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
        params![T::entity_type(), key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    Ok(row.and_then(|(data, cached_at)| {
      decode_row::<T>(key.to_string(), &data).map(|record| Stored {
        entity: record.entity,
        cached_at: parse_datetime(&cached_at),
      })
    }))
  }

  /// Every stored entity of `T`, ordered by primary key.
  pub fn all<T: Cacheable>(&self) -> ApiResult<Vec<T>> {
    Ok(
      self
        .records::<T>()?
        .into_iter()
        .map(|r| r.entity)
        .collect(),
    )
  }

  /// Entities of `T` matching the filter, in filter order.
  pub fn query<T: Cacheable>(&self, filter: &Filter) -> ApiResult<Vec<T>> {
    Ok(
      self
        .query_records::<T>(filter)?
        .into_iter()
        .map(|r| r.entity)
        .collect(),
    )
  }

  /// Like [`Store::query`], keeping keys and JSON for change tracking.
  pub fn query_records<T: Cacheable>(&self, filter: &Filter) -> ApiResult<Vec<Record<T>>> {
    let mut rows: Vec<(String, Value)> = self
      .records::<T>()?
      .into_iter()
      .filter(|r| filter.predicate.matches(&r.value))
      .map(|r| (r.key, r.value))
      .collect();
    filter.sort_records(&mut rows);

    Ok(
      rows
        .into_iter()
        .filter_map(|(key, value)| {
          let entity = serde_json::from_value(value.clone()).ok()?;
          Some(Record { key, value, entity })
        })
        .collect(),
    )
  }

  pub fn count<T: Cacheable>(&self, predicate: &Predicate) -> ApiResult<usize> {
    Ok(
      self
        .records::<T>()?
        .iter()
        .filter(|r| predicate.matches(&r.value))
        .count(),
    )
  }

  /// Load every decodable row of `T`. Rows that no longer decode are skipped.
  fn records<T: Cacheable>(&self) -> ApiResult<Vec<Record<T>>> {
    let conn = self.conn();
    let mut stmt = conn.prepare_cached(
      "SELECT entity_key, data FROM entities WHERE entity_type = ?1 ORDER BY entity_key",
    )?;
    let rows = stmt
      .query_map(params![T::entity_type()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(
      rows
        .into_iter()
        .filter_map(|(key, data)| decode_row::<T>(key, &data))
        .collect(),
    )
  }

  /// Remove every entity of `T`. Returns the number removed.
  pub fn clear<T: Cacheable>(&self) -> ApiResult<usize> {
    let keys = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      let keys = {
        let mut stmt = tx.prepare("SELECT entity_key FROM entities WHERE entity_type = ?1")?;
        let keys = stmt
          .query_map(params![T::entity_type()], |row| row.get::<_, String>(0))?
          .collect::<Result<Vec<_>, _>>()?;
        keys
      };
      tx.execute(
        "DELETE FROM resources WHERE entity_type = ?1",
        params![T::entity_type()],
      )?;
      tx.execute(
        "DELETE FROM entities WHERE entity_type = ?1",
        params![T::entity_type()],
      )?;
      tx.commit()?;
      keys
    };

    let removed = keys.len();
    self.notify(T::entity_type(), keys);
    Ok(removed)
  }

  /// Remove everything. Returns the number of entities removed.
  pub fn clear_all(&self) -> ApiResult<usize> {
    let rows = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      let rows = {
        let mut stmt = tx.prepare("SELECT entity_type, entity_key FROM entities ORDER BY entity_type")?;
        let rows = stmt
          .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
          .collect::<Result<Vec<_>, _>>()?;
        rows
      };
      tx.execute("DELETE FROM resources", [])?;
      tx.execute("DELETE FROM entities", [])?;
      tx.commit()?;
      rows
    };

    let removed = rows.len();
    let mut by_type: Vec<(String, Vec<String>)> = Vec::new();
    for (entity_type, key) in rows {
      match by_type.last_mut() {
        Some((t, keys)) if *t == entity_type => keys.push(key),
        _ => by_type.push((entity_type, vec![key])),
      }
    }
    for (entity_type, keys) in by_type {
      self.notify(&entity_type, keys);
    }
    Ok(removed)
  }

  /// Replace the cached result of a resource and upsert its entities.
  pub fn store_resource<T: Cacheable>(
    &self,
    resource_key: &str,
    description: &str,
    entities: &[T],
  ) -> ApiResult<()> {
    let keys = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      let keys = write_resource(&tx, resource_key, description, entities)?;
      tx.commit()?;
      keys
    };

    self.notify(T::entity_type(), keys);
    Ok(())
  }

  /// Cached result of a resource, `None` if it was never fetched.
  pub fn get_resource<T: Cacheable>(
    &self,
    resource_key: &str,
  ) -> ApiResult<Option<CachedResource<T>>> {
    read_resource(&self.conn(), resource_key)
  }

  /// Max updated_at recorded for a resource.
  pub fn resource_max_updated(&self, resource_key: &str) -> ApiResult<Option<String>> {
    let conn = self.conn();
    let value: Option<Option<String>> = conn
      .query_row(
        "SELECT max_updated FROM resources WHERE resource_key = ?1",
        params![resource_key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value.flatten())
  }

  /// Merge a delta into a resource: existing entities are replaced in place,
  /// new ones go to the front in delta order.
  ///
  /// Read, merge and write happen in one transaction under one lock, so
  /// concurrent merges into the same resource don't lose each other's rows.
  pub fn merge_resource<T: Cacheable>(
    &self,
    resource_key: &str,
    description: &str,
    delta: &[T],
  ) -> ApiResult<Vec<T>> {
    let (merged, keys) = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;

      let mut existing = read_resource::<T>(&tx, resource_key)?
        .map(|cached| cached.entities)
        .unwrap_or_default();
      let positions: HashMap<String, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, e)| (e.cache_key(), i))
        .collect();

      let mut fresh: Vec<T> = Vec::new();
      let mut fresh_positions: HashMap<String, usize> = HashMap::new();
      for entity in delta {
        let key = entity.cache_key();
        if let Some(&i) = positions.get(&key) {
          existing[i] = entity.clone();
        } else if let Some(&i) = fresh_positions.get(&key) {
          fresh[i] = entity.clone();
        } else {
          fresh_positions.insert(key, fresh.len());
          fresh.push(entity.clone());
        }
      }

      fresh.extend(existing);
      let keys = write_resource(&tx, resource_key, description, &fresh)?;
      tx.commit()?;
      (fresh, keys)
    };

    self.notify(T::entity_type(), keys);
    Ok(merged)
  }
}

fn write_resource<T: Cacheable>(
  conn: &Connection,
  resource_key: &str,
  description: &str,
  entities: &[T],
) -> ApiResult<Vec<String>> {
  let max_updated = entities
    .iter()
    .filter_map(|e| e.updated_at())
    .max()
    .map(String::from);

  // Keep a previous max_updated when this page carries none
  conn.execute(
    "INSERT INTO resources (resource_key, description, entity_type, max_updated, synced_at, result_count)
     VALUES (?1, ?2, ?3, ?4, datetime('now'), ?5)
     ON CONFLICT(resource_key) DO UPDATE SET
       description = excluded.description,
       entity_type = excluded.entity_type,
       max_updated = COALESCE(excluded.max_updated, resources.max_updated),
       synced_at = excluded.synced_at,
       result_count = excluded.result_count",
    params![resource_key, description, T::entity_type(), max_updated, entities.len()],
  )?;
  conn.execute(
    "DELETE FROM resource_entities WHERE resource_key = ?1",
    params![resource_key],
  )?;

  let keys = write_entities(conn, entities)?;
  let mut stmt = conn.prepare_cached(
    "INSERT OR REPLACE INTO resource_entities (resource_key, entity_key, position)
     VALUES (?1, ?2, ?3)",
  )?;
  for (position, key) in keys.iter().enumerate() {
    stmt.execute(params![resource_key, key, position])?;
  }
  Ok(keys)
}

fn read_resource<T: Cacheable>(
  conn: &Connection,
  resource_key: &str,
) -> ApiResult<Option<CachedResource<T>>> {
  let entity_type = T::entity_type();

  let info: Option<(String, Option<String>)> = conn
    .query_row(
      "SELECT synced_at, max_updated FROM resources
       WHERE resource_key = ?1 AND entity_type = ?2",
      params![resource_key, entity_type],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?;

  let (synced_at, max_updated) = match info {
    Some(info) => info,
    None => return Ok(None),
  };

  let mut stmt = conn.prepare_cached(
    "SELECT e.entity_key, e.data FROM entities e
     INNER JOIN resource_entities r ON e.entity_type = ?1 AND e.entity_key = r.entity_key
     WHERE r.resource_key = ?2
     ORDER BY r.position",
  )?;
  let rows = stmt
    .query_map(params![entity_type, resource_key], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?
    .collect::<Result<Vec<_>, _>>()?;

  let entities = rows
    .into_iter()
    .filter_map(|(key, data)| decode_row::<T>(key, &data))
    .map(|r| r.entity)
    .collect();

  Ok(Some(CachedResource {
    entities,
    synced_at: parse_datetime(&synced_at),
    max_updated,
  }))
}

fn write_entities<T: Cacheable>(conn: &Connection, entities: &[T]) -> ApiResult<Vec<String>> {
  let mut stmt = conn.prepare_cached(
    "INSERT OR REPLACE INTO entities (entity_type, entity_key, data, updated_at, cached_at)
     VALUES (?1, ?2, ?3, ?4, datetime('now'))",
  )?;

  let mut keys = Vec::with_capacity(entities.len());
  for entity in entities {
    let key = entity.cache_key();
    let data = serde_json::to_vec(entity)?;
    stmt.execute(params![T::entity_type(), key, data, entity.updated_at()])?;
    keys.push(key);
  }
  Ok(keys)
}

fn decode_row<T: Cacheable>(key: String, data: &[u8]) -> Option<Record<T>> {
  let value: Value = match serde_json::from_slice(data) {
    Ok(value) => value,
    Err(e) => {
      warn!(entity_type = T::entity_type(), key = %key, error = %e, "skipping unreadable row");
      return None;
    }
  };
  match serde_json::from_value::<T>(value.clone()) {
    Ok(entity) => Some(Record { key, value, entity }),
    Err(e) => {
      warn!(entity_type = T::entity_type(), key = %key, error = %e, "skipping row that no longer decodes");
      None
    }
  }
}

/// Parse a datetime string from SQLite format. Unparseable values count as
/// the epoch, which makes the row stale rather than failing the read.
fn parse_datetime(s: &str) -> DateTime<Utc> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
