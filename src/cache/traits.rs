//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};

use super::error::StoreResult;

/// Identity of a cached record, as produced by [`Identify`].
pub type RecordId = String;

/// Durable string-keyed storage backing the cache.
///
/// Methods take `&self`; implementations own whatever interior locking they
/// need (the SQLite store wraps its connection in a mutex).
pub trait KeyValueStore {
  /// Read the value stored under `key`.
  fn get(&self, key: &str) -> StoreResult<Option<String>>;

  /// Store `value` under `key`, overwriting any previous value.
  fn set(&self, key: &str, value: &str) -> StoreResult<()>;

  /// Remove `key`. Removing an absent key is not an error.
  fn remove(&self, key: &str) -> StoreResult<()>;

  /// Number of keys currently stored.
  fn len(&self) -> StoreResult<usize>;

  /// Key at position `index` in the store's enumeration order.
  fn key(&self, index: usize) -> StoreResult<Option<String>>;

  fn is_empty(&self) -> StoreResult<bool> {
    Ok(self.len()? == 0)
  }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &T {
  fn get(&self, key: &str) -> StoreResult<Option<String>> {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: &str) -> StoreResult<()> {
    (**self).set(key, value)
  }

  fn remove(&self, key: &str) -> StoreResult<()> {
    (**self).remove(key)
  }

  fn len(&self) -> StoreResult<usize> {
    (**self).len()
  }

  fn key(&self, index: usize) -> StoreResult<Option<String>> {
    (**self).key(index)
  }
}

/// Set algebra over query descriptors.
///
/// The cache never interprets descriptors itself: overlap, merging and
/// membership are all delegated here.
pub trait QueryLogic {
  /// Application-defined query description (filters, sort, paging).
  type Descriptor: Clone + Serialize + DeserializeOwned;
  /// Application data held in query results.
  type Record: Clone + Serialize + DeserializeOwned;

  /// Combined descriptor covering both `a` and `b`, or `None` when the two
  /// results should not be merged.
  fn union(&self, a: &Self::Descriptor, b: &Self::Descriptor) -> Option<Self::Descriptor>;

  /// Deterministic merge of two materialized results.
  fn get_union(
    &self,
    a: &Self::Descriptor,
    b: &Self::Descriptor,
    items_a: &[Self::Record],
    items_b: &[Self::Record],
  ) -> Vec<Self::Record>;

  /// Whether `record` satisfies the filter of `descriptor`.
  fn subset(&self, record: &Self::Record, descriptor: &Self::Descriptor) -> bool;
}

/// Extracts a stable id from a full record or a partial property map.
pub trait Identify<R> {
  fn identify(&self, record: &R) -> Option<RecordId>;
}

impl<R, F> Identify<R> for F
where
  F: Fn(&R) -> Option<RecordId>,
{
  fn identify(&self, record: &R) -> Option<RecordId> {
    self(record)
  }
}
