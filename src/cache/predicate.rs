//! Search and filter predicates evaluated locally against a single record.

use serde_json::Value;
use std::collections::BTreeMap;

use super::traits::Record;
use crate::key::ListParams;

/// Whether `record` belongs in a list described by `params`: it must match
/// the search term, every filter, and the status selector.
pub fn record_matches<R: Record>(params: &ListParams, record: &R) -> bool {
  search_matches(params.search.as_deref(), record)
    && filters_match(&params.filters, record)
    && params.status.selects(record.partition())
}

/// Case-insensitive substring search over the record's searchable text.
/// A missing or blank term matches everything.
pub fn search_matches<R: Record>(search: Option<&str>, record: &R) -> bool {
  let term = match search.map(str::trim) {
    Some(term) if !term.is_empty() => term.to_lowercase(),
    _ => return true,
  };
  record
    .search_text()
    .iter()
    .any(|text| text.to_lowercase().contains(&term))
}

/// Every filter must hold. Null and empty-string filter values are ignored.
pub fn filters_match<R: Record>(filters: &BTreeMap<String, Value>, record: &R) -> bool {
  filters
    .iter()
    .all(|(field, expected)| filter_matches(expected, record.field(field).as_ref()))
}

fn filter_matches(expected: &Value, actual: Option<&Value>) -> bool {
  match expected {
    Value::Null => true,
    Value::String(s) if s.is_empty() => true,
    Value::Array(options) => {
      options.is_empty() || options.iter().any(|option| values_equal(option, actual))
    }
    _ => values_equal(expected, actual),
  }
}

/// JSON equality with string/number leniency, since filter values usually
/// arrive from query strings as text.
fn values_equal(expected: &Value, actual: Option<&Value>) -> bool {
  let Some(actual) = actual else {
    return false;
  };
  match (expected, actual) {
    (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
      s.trim() == n.to_string()
    }
    (Value::String(s), Value::Bool(b)) | (Value::Bool(b), Value::String(s)) => {
      s.trim().eq_ignore_ascii_case(if *b { "true" } else { "false" })
    }
    _ => expected == actual,
  }
}
