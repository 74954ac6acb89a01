//! Per-id record storage with an in-memory read cache.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::error::Result;
use super::keys::StoreKeys;
use super::traits::{KeyValueStore, RecordId};

/// Maps record id to record payload.
///
/// Each record is persisted under its own store key; reads are memoized so
/// repeated materialization does not re-parse payloads.
#[derive(Debug)]
pub struct InstanceIndex<R> {
  keys: StoreKeys,
  memo: HashMap<RecordId, R>,
}

impl<R> InstanceIndex<R>
where
  R: Clone + Serialize + DeserializeOwned,
{
  pub fn new(keys: StoreKeys) -> Self {
    Self {
      keys,
      memo: HashMap::new(),
    }
  }

  /// Look up a record, reading through to the store on a memo miss.
  pub fn get<S: KeyValueStore + ?Sized>(&mut self, store: &S, id: &str) -> Result<Option<R>> {
    if let Some(record) = self.memo.get(id) {
      return Ok(Some(record.clone()));
    }

    let Some(raw) = store.get(&self.keys.instance(id))? else {
      return Ok(None);
    };
    let record: R = serde_json::from_str(&raw)?;
    self.memo.insert(id.to_string(), record.clone());
    Ok(Some(record))
  }

  /// Look up several records, aligned with `ids`.
  pub fn get_many<S: KeyValueStore + ?Sized>(
    &mut self,
    store: &S,
    ids: &[RecordId],
  ) -> Result<Vec<Option<R>>> {
    ids.iter().map(|id| self.get(store, id)).collect()
  }

  /// Write a record unconditionally. Last write wins.
  pub fn put<S: KeyValueStore + ?Sized>(&mut self, store: &S, id: &str, record: &R) -> Result<()> {
    let data = serde_json::to_string(record)?;
    store.set(&self.keys.instance(id), &data)?;
    self.memo.insert(id.to_string(), record.clone());
    Ok(())
  }

  pub fn remove<S: KeyValueStore + ?Sized>(&mut self, store: &S, id: &str) -> Result<()> {
    store.remove(&self.keys.instance(id))?;
    self.memo.remove(id);
    Ok(())
  }

  /// Drop every instance in this namespace, in the store and in memory.
  pub fn reset<S: KeyValueStore + ?Sized>(&mut self, store: &S) -> Result<usize> {
    let prefix = self.keys.instance_prefix();

    // Collect first: removing while enumerating by index shifts positions.
    let mut doomed = Vec::new();
    for index in 0..store.len()? {
      if let Some(key) = store.key(index)? {
        if key.starts_with(&prefix) {
          doomed.push(key);
        }
      }
    }

    for key in &doomed {
      store.remove(key)?;
    }
    self.memo.clear();

    debug!(removed = doomed.len(), "cleared instance index");
    Ok(doomed.len())
  }
}
