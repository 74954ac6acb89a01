//! Durable mapping from canonical descriptor keys to ordered id lists.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use tracing::{debug, warn};

use super::error::{CacheError, Result};
use super::instances::InstanceIndex;
use super::keys::{canonical_key, StoreKeys};
use super::traits::{KeyValueStore, RecordId};

/// What is currently known about a set's members.
///
/// Only ids are held here. Records always come from the [`InstanceIndex`],
/// so a write to one record is visible through every set that lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetState {
  /// Listed in the directory; the id list has not been read yet.
  Unloaded,
  /// Listed in the directory but the persisted id list is absent.
  Missing,
  /// Ordered member ids.
  Loaded(Vec<RecordId>),
}

/// A cached query result.
#[derive(Debug, Clone)]
pub struct SetEntry<D> {
  key: String,
  descriptor: D,
  state: SetState,
}

impl<D> SetEntry<D> {
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn descriptor(&self) -> &D {
    &self.descriptor
  }

  pub fn state(&self) -> &SetState {
    &self.state
  }

  /// Ids of the loaded members, or `None` until loaded.
  pub fn ids(&self) -> Option<&[RecordId]> {
    match &self.state {
      SetState::Loaded(ids) => Some(ids),
      _ => None,
    }
  }

  /// Read the persisted id list on first use. Ids with no stored record are
  /// dropped.
  fn load<S, R>(&mut self, keys: &StoreKeys, store: &S, instances: &mut InstanceIndex<R>) -> Result<()>
  where
    S: KeyValueStore + ?Sized,
    R: Clone + Serialize + DeserializeOwned,
  {
    if self.state != SetState::Unloaded {
      return Ok(());
    }

    self.state = match store.get(&keys.set(&self.key))? {
      None => {
        warn!(key = %self.key, "directory lists a set with no stored ids");
        SetState::Missing
      }
      Some(raw) => {
        let stored: Vec<RecordId> = serde_json::from_str(&raw)?;
        let found = instances.get_many(store, &stored)?;
        let ids = stored
          .into_iter()
          .zip(found)
          .filter_map(|(id, record)| match record {
            Some(_) => Some(id),
            None => {
              warn!(key = %self.key, %id, "dropping id with no stored instance");
              None
            }
          })
          .collect();
        SetState::Loaded(ids)
      }
    };
    Ok(())
  }

  /// Resolve the member ids into records through the instance index.
  ///
  /// Returns `None` when the id list is missing from the store.
  pub fn materialize<S, R>(
    &mut self,
    keys: &StoreKeys,
    store: &S,
    instances: &mut InstanceIndex<R>,
  ) -> Result<Option<Vec<R>>>
  where
    S: KeyValueStore + ?Sized,
    R: Clone + Serialize + DeserializeOwned,
  {
    self.load(keys, store, instances)?;
    let SetState::Loaded(ids) = &self.state else {
      return Ok(None);
    };

    let found = instances.get_many(store, ids)?;
    let mut records = Vec::with_capacity(ids.len());
    for (id, record) in ids.iter().zip(found) {
      match record {
        Some(record) => records.push(record),
        None => warn!(key = %self.key, %id, "set member has no stored instance"),
      }
    }
    Ok(Some(records))
  }

  /// Store first, so a failed write leaves the entry as it was.
  fn persist<S: KeyValueStore + ?Sized>(
    &mut self,
    keys: &StoreKeys,
    store: &S,
    ids: Vec<RecordId>,
  ) -> Result<()> {
    store.set(&keys.set(&self.key), &serde_json::to_string(&ids)?)?;
    self.state = SetState::Loaded(ids);
    Ok(())
  }
}

#[derive(Debug)]
enum Directory<D> {
  Unloaded,
  Loaded(BTreeMap<String, SetEntry<D>>),
}

/// Index of every cached set in one namespace.
///
/// Mutations persist the directory before touching the in-memory map, so a
/// failed store call never leaves the two disagreeing.
#[derive(Debug)]
pub struct SetIndex<D> {
  keys: StoreKeys,
  directory: Directory<D>,
}

impl<D> SetIndex<D>
where
  D: Clone + Serialize + DeserializeOwned,
{
  pub fn new(keys: StoreKeys) -> Self {
    Self {
      keys,
      directory: Directory::Unloaded,
    }
  }

  pub fn is_loaded(&self) -> bool {
    matches!(self.directory, Directory::Loaded(_))
  }

  /// Read the directory from the store, replacing any in-memory state.
  pub fn init<S: KeyValueStore + ?Sized>(&mut self, store: &S) -> Result<()> {
    let listed: Vec<String> = match store.get(&self.keys.directory())? {
      Some(raw) => serde_json::from_str(&raw)?,
      None => Vec::new(),
    };

    let mut entries = BTreeMap::new();
    for key in listed {
      match serde_json::from_str::<D>(&key) {
        Ok(descriptor) => {
          entries.insert(
            key.clone(),
            SetEntry {
              key,
              descriptor,
              state: SetState::Unloaded,
            },
          );
        }
        Err(e) => warn!(%key, error = %e, "skipping unreadable directory key"),
      }
    }

    debug!(sets = entries.len(), "loaded set directory");
    self.directory = Directory::Loaded(entries);
    Ok(())
  }

  fn entries<S: KeyValueStore + ?Sized>(
    &mut self,
    store: &S,
  ) -> Result<&mut BTreeMap<String, SetEntry<D>>> {
    if let Directory::Unloaded = self.directory {
      self.init(store)?;
    }
    match &mut self.directory {
      Directory::Loaded(entries) => Ok(entries),
      Directory::Unloaded => unreachable!("directory initialized above"),
    }
  }

  /// Persist the directory as it will look after adding `insert` and
  /// dropping `remove`.
  fn persist_directory<S: KeyValueStore + ?Sized>(
    &mut self,
    store: &S,
    insert: Option<&str>,
    remove: Option<&str>,
  ) -> Result<()> {
    let mut listed: BTreeSet<String> = self.entries(store)?.keys().cloned().collect();
    if let Some(key) = remove {
      listed.remove(key);
    }
    if let Some(key) = insert {
      listed.insert(key.to_string());
    }

    let listed: Vec<String> = listed.into_iter().collect();
    store.set(&self.keys.directory(), &serde_json::to_string(&listed)?)?;
    Ok(())
  }

  /// Exact-key lookup of a descriptor's entry.
  pub fn resolve<S: KeyValueStore + ?Sized>(
    &mut self,
    store: &S,
    descriptor: &D,
  ) -> Result<Option<&mut SetEntry<D>>> {
    let key = canonical_key(descriptor)?;
    Ok(self.entries(store)?.get_mut(&key))
  }

  /// Materialize the entry stored under `key`.
  ///
  /// `None` when no entry exists or its id list is missing.
  pub fn materialize<S, R>(
    &mut self,
    store: &S,
    instances: &mut InstanceIndex<R>,
    key: &str,
  ) -> Result<Option<Vec<R>>>
  where
    S: KeyValueStore + ?Sized,
    R: Clone + Serialize + DeserializeOwned,
  {
    let keys = self.keys.clone();
    match self.entries(store)?.get_mut(key) {
      Some(entry) => entry.materialize(&keys, store, instances),
      None => Ok(None),
    }
  }

  /// Canonical keys of every cached set.
  pub fn keys<S: KeyValueStore + ?Sized>(&mut self, store: &S) -> Result<Vec<String>> {
    Ok(self.entries(store)?.keys().cloned().collect())
  }

  pub fn descriptors<S: KeyValueStore + ?Sized>(&mut self, store: &S) -> Result<Vec<D>> {
    Ok(
      self
        .entries(store)?
        .values()
        .map(|entry| entry.descriptor.clone())
        .collect(),
    )
  }

  pub fn descriptor<S: KeyValueStore + ?Sized>(&mut self, store: &S, key: &str) -> Result<Option<D>> {
    Ok(self.entries(store)?.get(key).map(|entry| entry.descriptor.clone()))
  }

  /// Persist `ids` for the entry under `key`.
  ///
  /// When `new_descriptor` canonicalizes to a different key the entry is
  /// renamed: the ids are written under the new key, the directory is
  /// switched over, and only then is the old id list removed. An entry
  /// already cached under the new key is replaced.
  pub fn write<S: KeyValueStore + ?Sized>(
    &mut self,
    store: &S,
    key: &str,
    ids: Vec<RecordId>,
    new_descriptor: Option<&D>,
  ) -> Result<String> {
    let renamed = match new_descriptor {
      Some(descriptor) => {
        let new_key = canonical_key(descriptor)?;
        (new_key != key).then_some((new_key, descriptor))
      }
      None => None,
    };

    let keys = self.keys.clone();
    let Some((new_key, descriptor)) = renamed else {
      let entry = self
        .entries(store)?
        .get_mut(key)
        .ok_or_else(CacheError::not_found)?;
      entry.persist(&keys, store, ids)?;
      return Ok(key.to_string());
    };

    if !self.entries(store)?.contains_key(key) {
      return Err(CacheError::not_found());
    }

    store.set(&keys.set(&new_key), &serde_json::to_string(&ids)?)?;
    self.persist_directory(store, Some(&new_key), Some(key))?;

    let entries = self.entries(store)?;
    let mut entry = entries.remove(key).ok_or_else(CacheError::not_found)?;
    entry.key = new_key.clone();
    entry.descriptor = descriptor.clone();
    entry.state = SetState::Loaded(ids);
    if entries.insert(new_key.clone(), entry).is_some() {
      debug!(key = %new_key, "renamed set replaced an existing entry");
    }

    store.remove(&keys.set(key))?;
    debug!(from = %key, to = %new_key, "renamed set");
    Ok(new_key)
  }

  /// Register a new entry and persist its ids.
  pub fn create<S: KeyValueStore + ?Sized>(
    &mut self,
    store: &S,
    descriptor: &D,
    ids: Vec<RecordId>,
  ) -> Result<String> {
    let key = canonical_key(descriptor)?;
    store.set(&self.keys.set(&key), &serde_json::to_string(&ids)?)?;
    self.persist_directory(store, Some(&key), None)?;

    self.entries(store)?.insert(
      key.clone(),
      SetEntry {
        key: key.clone(),
        descriptor: descriptor.clone(),
        state: SetState::Loaded(ids),
      },
    );
    Ok(key)
  }

  /// Delete the entry under `key`. Returns whether it existed.
  pub fn remove<S: KeyValueStore + ?Sized>(&mut self, store: &S, key: &str) -> Result<bool> {
    if !self.entries(store)?.contains_key(key) {
      store.remove(&self.keys.set(key))?;
      return Ok(false);
    }

    self.persist_directory(store, None, Some(key))?;
    self.entries(store)?.remove(key);
    store.remove(&self.keys.set(key))?;
    Ok(true)
  }

  /// Remove every set and the directory itself.
  pub fn reset<S: KeyValueStore + ?Sized>(&mut self, store: &S) -> Result<usize> {
    let listed = self.keys(store)?;
    for key in &listed {
      store.remove(&self.keys.set(key))?;
    }
    store.remove(&self.keys.directory())?;
    self.directory = Directory::Unloaded;
    Ok(listed.len())
  }

  /// Visit every entry until the visitor breaks, returning its value.
  pub fn for_each_entry<S, R, T, F>(
    &mut self,
    store: &S,
    instances: &mut InstanceIndex<R>,
    mut visit: F,
  ) -> Result<Option<T>>
  where
    S: KeyValueStore + ?Sized,
    R: Clone + Serialize + DeserializeOwned,
    F: FnMut(&mut SetVisit<'_, S, D, R>) -> Result<ControlFlow<T>>,
  {
    if let Directory::Unloaded = self.directory {
      self.init(store)?;
    }
    let Directory::Loaded(entries) = &mut self.directory else {
      return Ok(None);
    };

    for entry in entries.values_mut() {
      let mut current = SetVisit {
        entry,
        keys: &self.keys,
        store,
        instances: &mut *instances,
      };
      if let ControlFlow::Break(value) = visit(&mut current)? {
        return Ok(Some(value));
      }
    }
    Ok(None)
  }
}

/// One entry handed to a [`SetIndex::for_each_entry`] visitor.
pub struct SetVisit<'a, S: ?Sized, D, R> {
  entry: &'a mut SetEntry<D>,
  keys: &'a StoreKeys,
  store: &'a S,
  instances: &'a mut InstanceIndex<R>,
}

impl<S, D, R> SetVisit<'_, S, D, R>
where
  S: KeyValueStore + ?Sized,
  R: Clone + Serialize + DeserializeOwned,
{
  pub fn key(&self) -> &str {
    &self.entry.key
  }

  pub fn descriptor(&self) -> &D {
    &self.entry.descriptor
  }

  /// Current member ids, loading them on first use. A missing id list reads
  /// as empty.
  pub fn ids(&mut self) -> Result<Vec<RecordId>> {
    self.entry.load(self.keys, self.store, self.instances)?;
    Ok(self.entry.ids().map(<[RecordId]>::to_vec).unwrap_or_default())
  }

  /// Current member records. A missing id list reads as empty.
  pub fn records(&mut self) -> Result<Vec<R>> {
    Ok(
      self
        .entry
        .materialize(self.keys, self.store, self.instances)?
        .unwrap_or_default(),
    )
  }

  /// Persist new member ids under the entry's own key.
  pub fn write(&mut self, ids: Vec<RecordId>) -> Result<()> {
    self.entry.persist(self.keys, self.store, ids)
  }
}
