//! Set algebra for JSON descriptors and records.
//!
//! A descriptor is a JSON object. Two configurable keys (`start` and `end`
//! by default) describe an inclusive page range over the result; every other
//! key is a filter on record fields. A scalar filter value must equal the
//! field, an array filter value must contain it.
//!
//! ```ignore
//! let logic = BasicQueryLogic::new(IdSchema::new(["_id"]));
//!
//! let first = json!({"due": "today", "start": 0, "end": 9});
//! let second = json!({"due": "today", "start": 10, "end": 19});
//! assert_eq!(
//!   logic.union(&first, &second),
//!   Some(json!({"due": "today", "start": 0, "end": 19}))
//! );
//! ```

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cache::{Identify, QueryLogic, RecordId};

/// Identity over one or more fields of a JSON object.
///
/// A single field yields its value as a string; several fields yield a JSON
/// array of their values. Partial objects work as long as the id fields are
/// present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdSchema {
  fields: Vec<String>,
}

impl IdSchema {
  pub fn new<I, F>(fields: I) -> Self
  where
    I: IntoIterator<Item = F>,
    F: Into<String>,
  {
    Self {
      fields: fields.into_iter().map(Into::into).collect(),
    }
  }

  pub fn fields(&self) -> &[String] {
    &self.fields
  }
}

impl Identify<Value> for IdSchema {
  fn identify(&self, record: &Value) -> Option<RecordId> {
    let object = record.as_object()?;
    match self.fields.as_slice() {
      [] => None,
      [field] => object.get(field).and_then(scalar_id),
      fields => {
        let values = fields
          .iter()
          .map(|field| object.get(field).filter(|v| !v.is_null()))
          .collect::<Option<Vec<_>>>()?;
        serde_json::to_string(&values).ok()
      }
    }
  }
}

fn scalar_id(value: &Value) -> Option<RecordId> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Descriptor keys holding the inclusive page bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Paging {
  pub start: String,
  pub end: String,
}

impl Default for Paging {
  fn default() -> Self {
    Self {
      start: "start".to_string(),
      end: "end".to_string(),
    }
  }
}

type Range = (u64, u64);

struct Parsed<'a> {
  filters: BTreeMap<&'a str, &'a Value>,
  range: Option<Range>,
}

/// [`QueryLogic`] for `serde_json::Value` descriptors and records.
#[derive(Debug, Clone)]
pub struct BasicQueryLogic {
  schema: IdSchema,
  paging: Paging,
}

impl BasicQueryLogic {
  pub fn new(schema: IdSchema) -> Self {
    Self {
      schema,
      paging: Paging::default(),
    }
  }

  pub fn with_paging(mut self, paging: Paging) -> Self {
    self.paging = paging;
    self
  }

  fn parse<'a>(&self, descriptor: &'a Value) -> Option<Parsed<'a>> {
    let object = descriptor.as_object()?;

    let filters = object
      .iter()
      .filter(|(key, _)| **key != self.paging.start && **key != self.paging.end)
      .map(|(key, value)| (key.as_str(), value))
      .collect();

    let start = object.get(&self.paging.start).and_then(Value::as_u64);
    let end = object.get(&self.paging.end).and_then(Value::as_u64);
    let range = match (start, end) {
      (None, None) => None,
      (start, end) => Some((start.unwrap_or(0), end.unwrap_or(u64::MAX))),
    };

    Some(Parsed { filters, range })
  }

  fn with_range(&self, base: &Value, (start, end): Range) -> Option<Value> {
    let mut object: Map<String, Value> = base.as_object()?.clone();
    object.insert(self.paging.start.clone(), Value::from(start));
    if end == u64::MAX {
      object.remove(&self.paging.end);
    } else {
      object.insert(self.paging.end.clone(), Value::from(end));
    }
    Some(Value::Object(object))
  }
}

/// Overlapping or adjacent ranges.
fn touches(a: Range, b: Range) -> bool {
  a.0 <= b.1.saturating_add(1) && b.0 <= a.1.saturating_add(1)
}

/// Every constraint in `loose` also appears in `strict`.
fn is_looser(loose: &BTreeMap<&str, &Value>, strict: &BTreeMap<&str, &Value>) -> bool {
  loose.iter().all(|(key, value)| strict.get(key) == Some(value))
}

fn matches(expected: &Value, actual: Option<&Value>) -> bool {
  match (expected, actual) {
    (_, None) => false,
    (Value::Array(allowed), Some(actual)) => allowed.contains(actual) || expected == actual,
    (expected, Some(actual)) => expected == actual,
  }
}

impl QueryLogic for BasicQueryLogic {
  type Descriptor = Value;
  type Record = Value;

  fn union(&self, a: &Value, b: &Value) -> Option<Value> {
    let (pa, pb) = (self.parse(a)?, self.parse(b)?);

    if pa.filters == pb.filters {
      return match (pa.range, pb.range) {
        (None, _) => Some(a.clone()),
        (Some(_), None) => Some(b.clone()),
        (Some(ra), Some(rb)) if touches(ra, rb) => {
          self.with_range(a, (ra.0.min(rb.0), ra.1.max(rb.1)))
        }
        _ => None,
      };
    }

    // An unpaged query absorbs any narrower one.
    if pa.range.is_none() && is_looser(&pa.filters, &pb.filters) {
      return Some(a.clone());
    }
    if pb.range.is_none() && is_looser(&pb.filters, &pa.filters) {
      return Some(b.clone());
    }
    None
  }

  fn get_union(&self, a: &Value, b: &Value, items_a: &[Value], items_b: &[Value]) -> Vec<Value> {
    if a == b {
      return items_b.to_vec();
    }

    let range_a = self.parse(a).and_then(|p| p.range);
    let range_b = self.parse(b).and_then(|p| p.range);
    let b_first = match (range_a, range_b) {
      (Some(ra), Some(rb)) => rb.0 < ra.0,
      (Some(_), None) => true,
      _ => false,
    };

    let incoming: HashMap<RecordId, &Value> = items_b
      .iter()
      .filter_map(|record| Some((self.schema.identify(record)?, record)))
      .collect();
    let (head, tail) = if b_first {
      (items_b, items_a)
    } else {
      (items_a, items_b)
    };

    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(head.len() + tail.len());
    for record in head.iter().chain(tail) {
      match self.schema.identify(record) {
        Some(id) => {
          if let Some(newest) = incoming.get(&id) {
            if seen.insert(id) {
              merged.push((*newest).clone());
            }
          } else if seen.insert(id) {
            merged.push(record.clone());
          }
        }
        None => merged.push(record.clone()),
      }
    }
    merged
  }

  /// Paging bounds are ignored: a lone record has no position.
  fn subset(&self, record: &Value, descriptor: &Value) -> bool {
    let Some(parsed) = self.parse(descriptor) else {
      return false;
    };
    let Some(fields) = record.as_object() else {
      return false;
    };
    parsed
      .filters
      .iter()
      .all(|(key, expected)| matches(expected, fields.get(*key)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn logic() -> BasicQueryLogic {
    BasicQueryLogic::new(IdSchema::new(["_id"]))
  }

  #[test]
  fn test_identify_single_field() {
    let schema = IdSchema::new(["_id"]);
    assert_eq!(schema.identify(&json!({"_id": 1, "due": "today"})), Some("1".to_string()));
    assert_eq!(schema.identify(&json!({"_id": "abc"})), Some("abc".to_string()));
    assert_eq!(schema.identify(&json!({"due": "today"})), None);
    assert_eq!(schema.identify(&json!({"_id": null})), None);
    assert_eq!(schema.identify(&json!([1, 2])), None);
  }

  #[test]
  fn test_identify_composite() {
    let schema = IdSchema::new(["org", "id"]);
    assert_eq!(
      schema.identify(&json!({"id": 4, "org": "acme", "x": true})),
      Some(r#"["acme",4]"#.to_string())
    );
    assert_eq!(schema.identify(&json!({"org": "acme"})), None);
  }

  #[test]
  fn test_subset_equality_and_membership() {
    let logic = logic();
    let record = json!({"_id": 1, "due": "today", "owner": "ana"});

    assert!(logic.subset(&record, &json!({})));
    assert!(logic.subset(&record, &json!({"due": "today"})));
    assert!(logic.subset(&record, &json!({"due": ["today", "tomorrow"]})));
    assert!(logic.subset(&record, &json!({"due": "today", "start": 5, "end": 9})));
    assert!(!logic.subset(&record, &json!({"due": "tomorrow"})));
    assert!(!logic.subset(&record, &json!({"priority": "high"})));
  }

  #[test]
  fn test_union_of_equal_descriptors() {
    let logic = logic();
    let d = json!({"due": "today"});
    assert_eq!(logic.union(&d, &d), Some(d.clone()));
  }

  #[test]
  fn test_union_of_disjoint_filters() {
    let logic = logic();
    assert_eq!(logic.union(&json!({"due": "today"}), &json!({"due": "tomorrow"})), None);
  }

  #[test]
  fn test_union_of_pages() {
    let logic = logic();
    let a = json!({"due": "today", "start": 0, "end": 9});

    assert_eq!(
      logic.union(&a, &json!({"due": "today", "start": 5, "end": 14})),
      Some(json!({"due": "today", "start": 0, "end": 14}))
    );
    assert_eq!(
      logic.union(&a, &json!({"due": "today", "start": 10, "end": 19})),
      Some(json!({"due": "today", "start": 0, "end": 19}))
    );
    assert_eq!(logic.union(&a, &json!({"due": "today", "start": 11, "end": 19})), None);
  }

  #[test]
  fn test_unpaged_absorbs_narrower() {
    let logic = logic();
    let all = json!({});
    assert_eq!(logic.union(&all, &json!({"due": "today"})), Some(all.clone()));
    assert_eq!(logic.union(&json!({"due": "today", "start": 0, "end": 4}), &all), Some(all.clone()));
    assert_eq!(
      logic.union(&json!({"due": "today"}), &json!({"due": "today", "start": 0, "end": 4})),
      Some(json!({"due": "today"}))
    );
  }

  #[test]
  fn test_get_union_orders_pages_and_dedupes() {
    let logic = logic();
    let a = json!({"start": 2, "end": 3});
    let b = json!({"start": 0, "end": 2});
    let items_a = vec![json!({"_id": 3}), json!({"_id": 4})];
    let items_b = vec![json!({"_id": 1}), json!({"_id": 2}), json!({"_id": 3, "fresh": true})];

    assert_eq!(
      logic.get_union(&a, &b, &items_a, &items_b),
      vec![
        json!({"_id": 1}),
        json!({"_id": 2}),
        json!({"_id": 3, "fresh": true}),
        json!({"_id": 4}),
      ]
    );
  }

  #[test]
  fn test_get_union_prefers_incoming_version() {
    let logic = logic();
    let items_a = vec![json!({"_id": 1, "v": 1}), json!({"_id": 2, "v": 1})];
    let items_b = vec![json!({"_id": 2, "v": 2}), json!({"_id": 3, "v": 2})];

    assert_eq!(
      logic.get_union(&json!({}), &json!({"due": "today"}), &items_a, &items_b),
      vec![
        json!({"_id": 1, "v": 1}),
        json!({"_id": 2, "v": 2}),
        json!({"_id": 3, "v": 2}),
      ]
    );
  }

  #[test]
  fn test_get_union_of_same_descriptor_replaces() {
    let logic = logic();
    let d = json!({"due": "today"});
    let fresh = vec![json!({"_id": 2})];
    assert_eq!(logic.get_union(&d, &d, &[json!({"_id": 1})], &fresh), fresh);
  }

  #[test]
  fn test_custom_paging_keys() {
    let logic = logic().with_paging(Paging {
      start: "offset".to_string(),
      end: "last".to_string(),
    });

    assert_eq!(
      logic.union(&json!({"offset": 0, "last": 4}), &json!({"offset": 5, "last": 9})),
      Some(json!({"offset": 0, "last": 9}))
    );
    assert!(logic.subset(&json!({"_id": 1}), &json!({"offset": 0, "last": 4})));
  }
}
