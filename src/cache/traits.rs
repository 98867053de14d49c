//! Core traits and types for cached list pages.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique identifier of a record within its resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Read an id from a JSON token. Strings are used as-is and integers are
  /// rendered in decimal, so `7` and `"7"` name the same record.
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
      Value::Number(n) => Some(Self(n.to_string())),
      _ => None,
    }
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for RecordId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for RecordId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<u64> for RecordId {
  fn from(n: u64) -> Self {
    Self(n.to_string())
  }
}

/// Mutually exclusive bucket a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
  Active,
  Deleted,
}

/// Trait for rows that can appear in a cached list page.
///
/// Implementors expose their identity, the partition they belong to, and
/// enough of their fields for search and filter predicates to be evaluated
/// without a round trip to the server.
pub trait Record: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {
  fn record_id(&self) -> RecordId;

  /// Partition derived from the record's own state (e.g. its soft-delete flag).
  fn partition(&self) -> Partition;

  /// Value of a named field, used by list filters.
  fn field(&self, name: &str) -> Option<Value>;

  /// Text the list search box is matched against.
  fn search_text(&self) -> Vec<String>;
}

/// Dynamic rows as produced by a generic admin API: a JSON object with an
/// `id` member and an optional `deleted_at` soft-delete marker.
impl Record for Value {
  fn record_id(&self) -> RecordId {
    self
      .get("id")
      .and_then(RecordId::from_value)
      .unwrap_or_else(|| RecordId(String::new()))
  }

  fn partition(&self) -> Partition {
    match self.get("deleted_at") {
      None | Some(Value::Null) => Partition::Active,
      Some(_) => Partition::Deleted,
    }
  }

  fn field(&self, name: &str) -> Option<Value> {
    self.get(name).cloned()
  }

  fn search_text(&self) -> Vec<String> {
    match self {
      Value::Object(map) => map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect(),
      _ => Vec::new(),
    }
  }
}

/// One cached, paginated result set.
///
/// Rows keep server order. `total_pages` is kept equal to
/// `ceil(total / limit)`, or 0 when `total` is 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPage<R> {
  pub rows: Vec<R>,
  pub page: u64,
  pub limit: u64,
  pub total: u64,
  pub total_pages: u64,
}

impl<R: Record> CachedPage<R> {
  pub fn new(rows: Vec<R>, page: u64, limit: u64, total: u64) -> Self {
    Self {
      rows,
      page,
      limit,
      total,
      total_pages: total_pages_for(total, limit),
    }
  }

  pub fn position(&self, id: &RecordId) -> Option<usize> {
    self.rows.iter().position(|row| &row.record_id() == id)
  }

  pub fn contains(&self, id: &RecordId) -> bool {
    self.position(id).is_some()
  }

  pub fn row_ids(&self) -> Vec<RecordId> {
    self.rows.iter().map(Record::record_id).collect()
  }

  pub fn is_first_page(&self) -> bool {
    self.page <= 1
  }

  pub(crate) fn recompute_total_pages(&mut self) {
    self.total_pages = total_pages_for(self.total, self.limit);
  }
}

/// `ceil(total / limit)`, 0 for an empty result or a degenerate limit.
pub fn total_pages_for(total: u64, limit: u64) -> u64 {
  if total == 0 || limit == 0 {
    0
  } else {
    total.div_ceil(limit)
  }
}
