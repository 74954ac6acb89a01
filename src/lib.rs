//! Client-side query-result cache.
//!
//! Cached lists and the records inside them are kept consistent as records
//! are created, updated and deleted. See [`cache::CacheEngine`].

pub mod cache;
pub mod config;
pub mod query;

pub use cache::{CacheEngine, CacheError, KeyValueStore, MergeMode, QueryLogic, SharedCache};
pub use query::{BasicQueryLogic, IdSchema, Paging};
