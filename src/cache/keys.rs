//! Canonical descriptor keys and the store key layout.

use serde::Serialize;

use super::error::Result;

/// Serialize a descriptor to its canonical cache key.
///
/// Going through `serde_json::Value` sorts object keys at every depth
/// (`serde_json::Map` is a `BTreeMap` without the `preserve_order` feature),
/// so two descriptors with the same content produce the same key regardless
/// of field order.
pub fn canonical_key<D: Serialize + ?Sized>(descriptor: &D) -> Result<String> {
  let value = serde_json::to_value(descriptor)?;
  Ok(serde_json::to_string(&value)?)
}

/// Store keys for one cache namespace.
///
/// - `{namespace}-sets`: directory, JSON array of canonical keys
/// - `{namespace}/set/{canonical}`: JSON array of ids
/// - `{namespace}/instance/{id}`: JSON record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
  namespace: String,
}

impl StoreKeys {
  pub fn new(namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn directory(&self) -> String {
    format!("{}-sets", self.namespace)
  }

  pub fn set(&self, canonical: &str) -> String {
    format!("{}/set/{}", self.namespace, canonical)
  }

  pub fn instance(&self, id: &str) -> String {
    format!("{}{}", self.instance_prefix(), id)
  }

  pub fn instance_prefix(&self) -> String {
    format!("{}/instance/", self.namespace)
  }
}
