//! Error types for cache operations.

use thiserror::Error;

/// Code reported by [`CacheError::NotFound`], mirroring HTTP 404.
pub const NOT_FOUND_CODE: u16 = 404;

pub type Result<T> = std::result::Result<T, CacheError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
  /// Nothing is cached for the requested descriptor or id.
  #[error("{message} (code {code})")]
  NotFound { message: String, code: u16 },

  /// Identity extraction produced no id.
  #[error("record has no identity")]
  MissingId,

  #[error("failed to serialize cache payload: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("cache lock poisoned: {0}")]
  Poisoned(String),
}

impl CacheError {
  pub fn not_found() -> Self {
    Self::NotFound {
      message: "no data".to_string(),
      code: NOT_FOUND_CODE,
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }

  /// HTTP-style status code for this error, if it carries one.
  pub fn code(&self) -> Option<u16> {
    match self {
      Self::NotFound { code, .. } => Some(*code),
      _ => None,
    }
  }
}

/// Errors raised by a [`KeyValueStore`](super::KeyValueStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to prepare store location: {0}")]
  Io(#[from] std::io::Error),

  #[error("store lock poisoned: {0}")]
  Poisoned(String),

  #[error("could not determine data directory")]
  NoDataDir,

  #[error("store backend error: {0}")]
  Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}
