//! Query keys and structural key matching.
//!
//! A query key is an ordered list of JSON tokens. The first token is always
//! the resource name (e.g. `"tags"`); list views append a parameter object
//! (`{ page, limit, search, filters, status }`). Keys compare structurally,
//! token by token, and a shorter key matches every key it is a prefix of.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::cache::{Partition, RecordId};

/// Structural identifier of one cached result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
  pub fn new(tokens: Vec<Value>) -> Self {
    Self(tokens)
  }

  /// Coarse key covering every view of a resource, e.g. `["tags"]`.
  pub fn resource(name: &str) -> Self {
    Self(vec![Value::String(name.to_string())])
  }

  /// Key of one paginated list view, e.g. `["tags", { page: 1, ... }]`.
  pub fn list(name: &str, params: &ListParams) -> Self {
    // ListParams only holds strings, integers and JSON values, so this cannot fail
    let params = serde_json::to_value(params).unwrap_or(Value::Null);
    Self(vec![Value::String(name.to_string()), params])
  }

  /// Key of a single-record view, e.g. `["tags", "detail", "42"]`.
  pub fn detail(name: &str, id: &RecordId) -> Self {
    Self(vec![
      Value::String(name.to_string()),
      Value::String("detail".to_string()),
      Value::String(id.to_string()),
    ])
  }

  /// Append a token, returning the longer key.
  pub fn with_token(mut self, token: impl Into<Value>) -> Self {
    self.0.push(token.into());
    self
  }

  pub fn tokens(&self) -> &[Value] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// The resource name, if the first token is a string.
  pub fn resource_name(&self) -> Option<&str> {
    self.0.first().and_then(Value::as_str)
  }

  /// The coarse `[resource]` key this key belongs to.
  pub fn resource_key(&self) -> Option<QueryKey> {
    self.0.first().map(|first| Self(vec![first.clone()]))
  }

  /// Decode the list parameters carried in the second token.
  ///
  /// Returns None for resource keys, detail keys, malformed parameter
  /// objects and a zero page size; callers treat all of those as "not a
  /// list page".
  pub fn list_params(&self) -> Option<ListParams> {
    match self.0.get(1) {
      Some(token @ Value::Object(_)) => serde_json::from_value::<ListParams>(token.clone())
        .ok()
        .filter(|params| params.limit > 0),
      _ => None,
    }
  }

  /// True when every token of `self` equals the token at the same index of `other`.
  pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
    !self.is_empty()
      && self.len() <= other.len()
      && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
  }

  /// Canonical serialized form. Object members are emitted in sorted order,
  /// so structurally equal keys always produce the same string.
  pub fn description(&self) -> String {
    serde_json::to_string(&self.0).unwrap_or_default()
  }

  /// SHA256 of the canonical form, used as a stable fixed-length bucket id.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<Vec<Value>> for QueryKey {
  fn from(tokens: Vec<Value>) -> Self {
    Self(tokens)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}

/// Whether two keys refer to the same or a related data set.
///
/// Same-length keys must be equal token for token. Otherwise the shorter key
/// must be a prefix of the longer one; the argument order does not matter.
/// An empty key never matches anything.
pub fn matches(a: &QueryKey, b: &QueryKey) -> bool {
  if a.is_empty() || b.is_empty() {
    return false;
  }
  let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
  shorter.is_prefix_of(longer)
}

/// Whether two keys share the same resource token. This is the broad scan
/// used when no exact or prefix match exists.
pub fn same_resource(a: &QueryKey, b: &QueryKey) -> bool {
  match (a.0.first(), b.0.first()) {
    (Some(x), Some(y)) => x == y,
    _ => false,
  }
}

/// Which logical partition a list view shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
  #[default]
  Active,
  Deleted,
  All,
}

impl StatusFilter {
  pub fn selects(self, partition: Partition) -> bool {
    match self {
      StatusFilter::All => true,
      StatusFilter::Active => partition == Partition::Active,
      StatusFilter::Deleted => partition == Partition::Deleted,
    }
  }
}

/// Parameters of one paginated list view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListParams {
  /// 1-based page number
  pub page: u64,
  pub limit: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub filters: BTreeMap<String, Value>,
  pub status: StatusFilter,
}

impl Default for ListParams {
  fn default() -> Self {
    Self {
      page: 1,
      limit: 10,
      search: None,
      filters: BTreeMap::new(),
      status: StatusFilter::Active,
    }
  }
}

impl ListParams {
  pub fn new(page: u64, limit: u64) -> Self {
    Self {
      page,
      limit,
      ..Self::default()
    }
  }

  pub fn with_search(mut self, search: impl Into<String>) -> Self {
    self.search = Some(search.into());
    self
  }

  pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filters.insert(field.into(), value.into());
    self
  }

  pub fn with_status(mut self, status: StatusFilter) -> Self {
    self.status = status;
    self
  }

  /// Page 0 is treated as the first page.
  pub fn is_first_page(&self) -> bool {
    self.page <= 1
  }

  /// Index of the first row of this page in the full result.
  pub fn offset(&self) -> u64 {
    self.page.saturating_sub(1) * self.limit
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use serde_json::json;

  fn key(tokens: Value) -> QueryKey {
    serde_json::from_value(tokens).unwrap()
  }

  #[test]
  fn test_exact_match() {
    let a = key(json!(["tags", {"page": 1}]));
    let b = key(json!(["tags", {"page": 1}]));
    assert!(matches(&a, &b));
  }

  #[test]
  fn test_same_length_different_token() {
    let a = key(json!(["tags", {"page": 1}]));
    let b = key(json!(["tags", {"page": 2}]));
    assert!(!matches(&a, &b));
  }

  #[test]
  fn test_prefix_match_both_orders() {
    let coarse = QueryKey::resource("tags");
    let specific = QueryKey::list("tags", &ListParams::new(1, 10));
    assert!(matches(&coarse, &specific));
    assert!(matches(&specific, &coarse));
  }

  #[test]
  fn test_different_resource_does_not_match() {
    let a = QueryKey::resource("tags");
    let b = QueryKey::list("users", &ListParams::default());
    assert!(!matches(&a, &b));
  }

  #[test]
  fn test_empty_key_never_matches() {
    let empty = QueryKey::default();
    assert!(!matches(&empty, &empty));
    assert!(!matches(&empty, &QueryKey::resource("tags")));
    assert!(!matches(&QueryKey::resource("tags"), &empty));
  }

  #[test]
  fn test_object_tokens_compare_structurally() {
    let a = key(json!(["tags", {"page": 1, "limit": 10}]));
    let b = key(json!(["tags", {"limit": 10, "page": 1}]));
    assert!(matches(&a, &b));
    assert_eq!(a.description(), b.description());
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_list_params_round_trip_through_key() {
    let params = ListParams::new(2, 25)
      .with_search("rust")
      .with_filter("color", "red")
      .with_status(StatusFilter::Deleted);
    let key = QueryKey::list("tags", &params);

    assert_eq!(key.resource_name(), Some("tags"));
    assert_eq!(key.list_params(), Some(params));
  }

  #[test]
  fn test_list_params_defaults_for_missing_fields() {
    let key = key(json!(["tags", {"page": 3}]));
    let params = key.list_params().unwrap();
    assert_eq!(params.page, 3);
    assert_eq!(params.limit, 10);
    assert_eq!(params.status, StatusFilter::Active);
  }

  #[test]
  fn test_list_params_absent_for_detail_and_malformed_keys() {
    assert!(QueryKey::detail("tags", &RecordId::from("7")).list_params().is_none());
    assert!(QueryKey::resource("tags").list_params().is_none());
    assert!(key(json!(["tags", {"page": "one"}])).list_params().is_none());
  }

  #[test]
  fn test_zero_limit_is_not_a_list_page() {
    assert!(key(json!(["tags", {"page": 1, "limit": 0}])).list_params().is_none());
    assert!(QueryKey::list("tags", &ListParams::new(1, 0)).list_params().is_none());
  }

  #[test]
  fn test_status_filter_selects() {
    assert!(StatusFilter::Active.selects(Partition::Active));
    assert!(!StatusFilter::Active.selects(Partition::Deleted));
    assert!(StatusFilter::Deleted.selects(Partition::Deleted));
    assert!(StatusFilter::All.selects(Partition::Active));
    assert!(StatusFilter::All.selects(Partition::Deleted));
  }

  #[test]
  fn test_same_resource() {
    let a = key(json!(["tags", {"page": 1}]));
    let b = key(json!(["tags", {"page": 2}]));
    assert!(same_resource(&a, &b));
    assert!(!same_resource(&a, &QueryKey::resource("users")));
    assert!(!same_resource(&a, &QueryKey::default()));
  }

  fn token() -> impl Strategy<Value = Value> {
    prop_oneof![
      "[a-c]{1,2}".prop_map(Value::from),
      (0u8..4).prop_map(Value::from),
      (0u8..3).prop_map(|page| json!({ "page": page })),
    ]
  }

  proptest! {
    #[test]
    fn prop_prefix_match_is_symmetric(
      prefix in prop::collection::vec(token(), 1..4),
      suffix in prop::collection::vec(token(), 0..3),
    ) {
      let a = QueryKey::new(prefix.clone());
      let mut longer = prefix;
      longer.extend(suffix);
      let b = QueryKey::new(longer);

      prop_assert!(matches(&a, &b));
      prop_assert!(matches(&b, &a));
    }

    #[test]
    fn prop_same_length_keys_require_equality(
      a in prop::collection::vec(token(), 1..4),
      b in prop::collection::vec(token(), 1..4),
    ) {
      prop_assume!(a.len() == b.len());
      let equal = a == b;
      prop_assert_eq!(matches(&QueryKey::new(a), &QueryKey::new(b)), equal);
    }
  }
}
