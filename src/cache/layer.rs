//! Cache engine that keeps cached query results and records consistent.

use serde::Deserialize;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::error::{CacheError, Result};
use super::instances::InstanceIndex;
use super::keys::{canonical_key, StoreKeys};
use super::sets::SetIndex;
use super::traits::{Identify, KeyValueStore, QueryLogic, RecordId};

/// How a written list is merged into overlapping cached sets.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
  /// Only the first overlapping set absorbs the new data. Other overlapping
  /// sets are left as they were and may go stale.
  #[default]
  First,
  /// Every overlapping set absorbs the new data.
  All,
}

type Descriptor<L> = <L as QueryLogic>::Descriptor;
type Record<L> = <L as QueryLogic>::Record;

/// Orchestrates the set and instance indexes.
///
/// Every operation runs to completion against the store; nothing here is
/// safe to interleave. Use [`SharedCache`] to share one engine across
/// threads.
pub struct CacheEngine<S, L, I>
where
  L: QueryLogic,
{
  store: S,
  logic: L,
  identify: I,
  keys: StoreKeys,
  sets: SetIndex<Descriptor<L>>,
  instances: InstanceIndex<Record<L>>,
  merge_mode: MergeMode,
}

impl<S, L, I> CacheEngine<S, L, I>
where
  S: KeyValueStore,
  L: QueryLogic,
  I: Identify<Record<L>>,
{
  /// Create an engine for `namespace` and load its set directory.
  pub fn open(namespace: &str, store: S, logic: L, identify: I) -> Result<Self> {
    let keys = StoreKeys::new(namespace);
    let mut sets = SetIndex::new(keys.clone());
    sets.init(&store)?;

    debug!(namespace, "opened cache engine");
    Ok(Self {
      store,
      logic,
      identify,
      instances: InstanceIndex::new(keys.clone()),
      keys,
      sets,
      merge_mode: MergeMode::default(),
    })
  }

  /// Set how list writes merge into overlapping sets.
  pub fn with_merge_mode(mut self, merge_mode: MergeMode) -> Self {
    self.merge_mode = merge_mode;
    self
  }

  pub fn merge_mode(&self) -> MergeMode {
    self.merge_mode
  }

  pub fn namespace(&self) -> &str {
    self.keys.namespace()
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  fn id_of(&self, record: &Record<L>) -> Result<RecordId> {
    self.identify.identify(record).ok_or(CacheError::MissingId)
  }

  fn ids_of(&self, records: &[Record<L>]) -> Result<Vec<RecordId>> {
    records.iter().map(|record| self.id_of(record)).collect()
  }

  /// Cached result for exactly this descriptor.
  ///
  /// Fails with `NotFound` when the descriptor was never cached (or its id
  /// list was lost), which is distinct from an empty cached result.
  pub fn get_list_data(&mut self, descriptor: &Descriptor<L>) -> Result<Vec<Record<L>>> {
    let key = canonical_key(descriptor)?;
    let records = match self.sets.resolve(&self.store, descriptor)? {
      Some(entry) => entry.materialize(&self.keys, &self.store, &mut self.instances)?,
      None => None,
    };

    match records {
      Some(records) => {
        debug!(%key, count = records.len(), "list cache hit");
        Ok(records)
      }
      None => {
        debug!(%key, "list cache miss");
        Err(CacheError::not_found())
      }
    }
  }

  /// Cached record identified by `props`, which may be a partial record.
  pub fn get_instance_data(&mut self, props: &Record<L>) -> Result<Record<L>> {
    let id = self.id_of(props)?;
    self.get_instance_by_id(&id)
  }

  pub fn get_instance_by_id(&mut self, id: &str) -> Result<Record<L>> {
    match self.instances.get(&self.store, id)? {
      Some(record) => Ok(record),
      None => {
        debug!(%id, "instance cache miss");
        Err(CacheError::not_found())
      }
    }
  }

  /// Cache `records` as the result of `descriptor`.
  ///
  /// Every record is written to the instance index first. When a cached set
  /// overlaps `descriptor`, the two results are merged into it (and it is
  /// renamed to the combined descriptor); otherwise a new set is created.
  pub fn update_list_data(
    &mut self,
    records: Vec<Record<L>>,
    descriptor: &Descriptor<L>,
  ) -> Result<()> {
    let ids = self.ids_of(&records)?;
    for (id, record) in ids.iter().zip(&records) {
      self.instances.put(&self.store, id, record)?;
    }

    let mut merged_any = false;
    for key in self.sets.keys(&self.store)? {
      let Some(cached) = self.sets.descriptor(&self.store, &key)? else {
        // Renamed away by an earlier merge in this call.
        continue;
      };
      let Some(combined) = self.logic.union(&cached, descriptor) else {
        continue;
      };

      let existing = self
        .sets
        .materialize(&self.store, &mut self.instances, &key)?
        .unwrap_or_default();
      let merged = self.logic.get_union(&cached, descriptor, &existing, &records);
      let merged_ids = self.ids_of(&merged)?;
      let new_key = self
        .sets
        .write(&self.store, &key, merged_ids, Some(&combined))?;

      info!(from = %key, to = %new_key, "merged list into cached set");
      merged_any = true;
      if self.merge_mode == MergeMode::First {
        break;
      }
    }

    if !merged_any {
      let count = ids.len();
      let key = self.sets.create(&self.store, descriptor, ids)?;
      info!(%key, count, "cached new set");
    }
    Ok(())
  }

  /// Add a new record to every cached set it belongs to.
  ///
  /// A set that already lists the record's id keeps it at its current
  /// position instead of gaining a second entry; the stored record is
  /// replaced either way.
  pub fn create_instance_data(&mut self, record: Record<L>) -> Result<()> {
    let id = self.id_of(&record)?;
    self.instances.put(&self.store, &id, &record)?;
    let logic = &self.logic;

    self
      .sets
      .for_each_entry(&self.store, &mut self.instances, |set| {
        if !logic.subset(&record, set.descriptor()) {
          return Ok(ControlFlow::<()>::Continue(()));
        }

        let mut ids = set.ids()?;
        if !ids.contains(&id) {
          ids.push(id.clone());
          debug!(key = %set.key(), %id, "added record to set");
        }
        set.write(ids)?;
        Ok(ControlFlow::Continue(()))
      })?;
    Ok(())
  }

  /// Re-evaluate a changed record's membership in every cached set.
  ///
  /// Afterwards the record is present in a set iff it satisfies that set's
  /// descriptor, and appears at most once.
  pub fn update_instance_data(&mut self, record: Record<L>) -> Result<()> {
    let id = self.id_of(&record)?;
    self.instances.put(&self.store, &id, &record)?;
    let logic = &self.logic;

    self
      .sets
      .for_each_entry(&self.store, &mut self.instances, |set| {
        let mut ids = set.ids()?;
        let index = ids.iter().position(|member| *member == id);

        match (logic.subset(&record, set.descriptor()), index) {
          (true, None) => ids.push(id.clone()),
          (false, Some(index)) => {
            ids.remove(index);
            debug!(key = %set.key(), %id, "record left set");
          }
          _ => return Ok(ControlFlow::<()>::Continue(())),
        }

        set.write(ids)?;
        Ok(ControlFlow::Continue(()))
      })?;
    Ok(())
  }

  /// Remove a record from every cached set and from the instance index.
  pub fn destroy_instance_data(&mut self, props: &Record<L>) -> Result<()> {
    let id = self.id_of(props)?;

    self
      .sets
      .for_each_entry(&self.store, &mut self.instances, |set| {
        let mut ids = set.ids()?;
        if let Some(index) = ids.iter().position(|member| *member == id) {
          ids.remove(index);
          set.write(ids)?;
          debug!(key = %set.key(), %id, "removed record from set");
        }
        Ok(ControlFlow::<()>::Continue(()))
      })?;

    self.instances.remove(&self.store, &id)
  }

  /// Drop the cached set for exactly this descriptor. Records stay cached.
  pub fn evict_list_data(&mut self, descriptor: &Descriptor<L>) -> Result<bool> {
    let key = canonical_key(descriptor)?;
    let existed = self.sets.remove(&self.store, &key)?;
    if existed {
      info!(%key, "evicted cached set");
    }
    Ok(existed)
  }

  /// Descriptors of every cached set.
  pub fn cached_descriptors(&mut self) -> Result<Vec<Descriptor<L>>> {
    self.sets.descriptors(&self.store)
  }

  /// Destroy every cached set and record in this namespace.
  pub fn reset(&mut self) -> Result<()> {
    let sets = self.sets.reset(&self.store)?;
    let instances = self.instances.reset(&self.store)?;
    info!(sets, instances, namespace = %self.keys.namespace(), "cache reset");
    Ok(())
  }
}

/// A [`CacheEngine`] behind a single mutex.
///
/// Each operation holds the lock for its whole duration, so reads and
/// writes of the same set never interleave.
pub struct SharedCache<S, L, I>
where
  L: QueryLogic,
{
  engine: Arc<Mutex<CacheEngine<S, L, I>>>,
}

impl<S, L, I> SharedCache<S, L, I>
where
  S: KeyValueStore,
  L: QueryLogic,
  I: Identify<Record<L>>,
{
  pub fn new(engine: CacheEngine<S, L, I>) -> Self {
    Self {
      engine: Arc::new(Mutex::new(engine)),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, CacheEngine<S, L, I>>> {
    self
      .engine
      .lock()
      .map_err(|e| CacheError::Poisoned(e.to_string()))
  }

  /// Run `f` with exclusive access to the engine.
  pub fn with<T>(&self, f: impl FnOnce(&mut CacheEngine<S, L, I>) -> Result<T>) -> Result<T> {
    f(&mut *self.lock()?)
  }

  pub fn get_list_data(&self, descriptor: &Descriptor<L>) -> Result<Vec<Record<L>>> {
    self.lock()?.get_list_data(descriptor)
  }

  pub fn get_instance_data(&self, props: &Record<L>) -> Result<Record<L>> {
    self.lock()?.get_instance_data(props)
  }

  pub fn update_list_data(&self, records: Vec<Record<L>>, descriptor: &Descriptor<L>) -> Result<()> {
    self.lock()?.update_list_data(records, descriptor)
  }

  pub fn create_instance_data(&self, record: Record<L>) -> Result<()> {
    self.lock()?.create_instance_data(record)
  }

  pub fn update_instance_data(&self, record: Record<L>) -> Result<()> {
    self.lock()?.update_instance_data(record)
  }

  pub fn destroy_instance_data(&self, props: &Record<L>) -> Result<()> {
    self.lock()?.destroy_instance_data(props)
  }

  pub fn evict_list_data(&self, descriptor: &Descriptor<L>) -> Result<bool> {
    self.lock()?.evict_list_data(descriptor)
  }

  pub fn reset(&self) -> Result<()> {
    self.lock()?.reset()
  }
}

impl<S, L, I> Clone for SharedCache<S, L, I>
where
  L: QueryLogic,
{
  fn clone(&self) -> Self {
    Self {
      engine: Arc::clone(&self.engine),
    }
  }
}
