//! Set-indexed cache for query results and the records they contain.
//!
//! This module provides a storage-agnostic cache that:
//! - Stores each record once, keyed by its id
//! - Stores each query result as an ordered id list keyed by its canonical descriptor
//! - Merges overlapping query results through an injected [`QueryLogic`]
//! - Propagates record create/update/delete to every cached result that may hold it

mod error;
mod instances;
mod keys;
mod layer;
mod sets;
mod storage;
mod traits;

pub use error::{CacheError, Result, StoreError, StoreResult, NOT_FOUND_CODE};
pub use instances::InstanceIndex;
pub use keys::{canonical_key, StoreKeys};
pub use layer::{CacheEngine, MergeMode, SharedCache};
pub use sets::{SetEntry, SetIndex, SetState, SetVisit};
pub use storage::{MemoryStore, SqliteStore};
pub use traits::{Identify, KeyValueStore, QueryLogic, RecordId};
