//! Live queries: store-held queries that report incremental change sets.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

use crate::error::{ApiError, ApiResult};

use super::predicate::Filter;
use super::storage::{Record, Store, StoreChange};
use super::traits::Cacheable;

/// How an ordered result changed between two evaluations.
///
/// `deletions` index the previous results; `insertions` and
/// `modifications` index the new ones. All ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
  pub deletions: Vec<usize>,
  pub insertions: Vec<usize>,
  pub modifications: Vec<usize>,
}

impl ChangeSet {
  pub fn is_empty(&self) -> bool {
    self.deletions.is_empty() && self.insertions.is_empty() && self.modifications.is_empty()
  }
}

/// Diff two keyed, ordered snapshots.
///
/// Records present in both keep their slot when they lie on the longest run
/// of increasing old positions; any other survivor moved and is reported as
/// a deletion plus an insertion. Unmoved survivors with different content are
/// modifications.
pub fn diff<K, V>(old: &[(K, V)], new: &[(K, V)]) -> ChangeSet
where
  K: Eq + Hash,
  V: PartialEq,
{
  let old_index: HashMap<&K, usize> = old.iter().enumerate().map(|(i, (k, _))| (k, i)).collect();
  let new_keys: HashSet<&K> = new.iter().map(|(k, _)| k).collect();

  let mut changes = ChangeSet::default();
  for (i, (key, _)) in old.iter().enumerate() {
    if !new_keys.contains(key) {
      changes.deletions.push(i);
    }
  }

  // (new index, old index) of survivors, in new order
  let mut survivors = Vec::new();
  for (i, (key, _)) in new.iter().enumerate() {
    match old_index.get(key) {
      Some(&j) => survivors.push((i, j)),
      None => changes.insertions.push(i),
    }
  }

  let old_positions: Vec<usize> = survivors.iter().map(|&(_, j)| j).collect();
  let stable: HashSet<usize> = longest_increasing(&old_positions).into_iter().collect();

  for (n, &(i, j)) in survivors.iter().enumerate() {
    if stable.contains(&n) {
      if old[j].1 != new[i].1 {
        changes.modifications.push(i);
      }
    } else {
      changes.deletions.push(j);
      changes.insertions.push(i);
    }
  }

  changes.deletions.sort_unstable();
  changes.insertions.sort_unstable();
  changes.modifications.sort_unstable();
  changes
}

/// Indices (into `seq`) of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> Vec<usize> {
  // tails[k]: index in seq of the smallest tail of an increasing run of length k+1
  let mut tails: Vec<usize> = Vec::new();
  let mut prev: Vec<Option<usize>> = vec![None; seq.len()];

  for (i, &value) in seq.iter().enumerate() {
    let pos = tails.partition_point(|&t| seq[t] < value);
    if pos > 0 {
      prev[i] = Some(tails[pos - 1]);
    }
    if pos == tails.len() {
      tails.push(i);
    } else {
      tails[pos] = i;
    }
  }

  let mut out = Vec::with_capacity(tails.len());
  let mut cursor = tails.last().copied();
  while let Some(i) = cursor {
    out.push(i);
    cursor = prev[i];
  }
  out.reverse();
  out
}

/// A query over the store that stays current as the store mutates.
///
/// Subscribes before the first evaluation, so no write between construction
/// and the first `poll` is missed.
pub struct LiveQuery<T: Cacheable> {
  store: Arc<Store>,
  filter: Filter,
  records: Vec<Record<T>>,
  rx: broadcast::Receiver<StoreChange>,
}

impl<T: Cacheable> LiveQuery<T> {
  pub fn new(store: Arc<Store>, filter: Filter) -> ApiResult<Self> {
    let rx = store.subscribe();
    let records = store.query_records::<T>(&filter)?;
    Ok(Self {
      store,
      filter,
      records,
      rx,
    })
  }

  pub fn results(&self) -> impl Iterator<Item = &T> + '_ {
    self.records.iter().map(|r| &r.entity)
  }

  pub fn to_vec(&self) -> Vec<T> {
    self.results().cloned().collect()
  }

  pub fn get(&self, index: usize) -> Option<&T> {
    self.records.get(index).map(|r| &r.entity)
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn filter(&self) -> &Filter {
    &self.filter
  }

  /// Swap the filter (e.g. the search text changed) and report the difference.
  pub fn set_filter(&mut self, filter: Filter) -> ApiResult<ChangeSet> {
    self.filter = filter;
    self.reevaluate()
  }

  /// Drain pending store notifications without blocking.
  ///
  /// Returns a change set only when the results actually differ.
  pub fn poll(&mut self) -> ApiResult<Option<ChangeSet>> {
    let mut dirty = false;
    loop {
      match self.rx.try_recv() {
        Ok(change) => dirty |= change.entity_type == T::entity_type(),
        Err(TryRecvError::Lagged(_)) => dirty = true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
      }
    }

    if !dirty {
      return Ok(None);
    }
    let changes = self.reevaluate()?;
    Ok((!changes.is_empty()).then_some(changes))
  }

  /// Wait for the next non-empty change set.
  pub async fn changed(&mut self) -> ApiResult<ChangeSet> {
    loop {
      match self.rx.recv().await {
        Ok(change) if change.entity_type != T::entity_type() => continue,
        Ok(_) | Err(RecvError::Lagged(_)) => {
          if let Some(changes) = self.poll()? {
            return Ok(changes);
          }
          // The triggering notification was already consumed above
          let changes = self.reevaluate()?;
          if !changes.is_empty() {
            return Ok(changes);
          }
        }
        Err(RecvError::Closed) => return Err(ApiError::Disconnected),
      }
    }
  }

  fn reevaluate(&mut self) -> ApiResult<ChangeSet> {
    let records = self.store.query_records::<T>(&self.filter)?;

    let old: Vec<(&str, &serde_json::Value)> = self
      .records
      .iter()
      .map(|r| (r.key.as_str(), &r.value))
      .collect();
    let new: Vec<(&str, &serde_json::Value)> = records
      .iter()
      .map(|r| (r.key.as_str(), &r.value))
      .collect();
    let changes = diff(&old, &new);

    trace!(
      entity_type = T::entity_type(),
      deleted = changes.deletions.len(),
      inserted = changes.insertions.len(),
      modified = changes.modifications.len(),
      "live query re-evaluated"
    );

    self.records = records;
    Ok(changes)
  }
}
