//! Cache store trait and in-memory implementation.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::traits::{CachedPage, Record};
use crate::key::QueryKey;
use crate::utils::lock;

/// Trait for the store holding materialized list pages.
///
/// The engine only ever reads and writes whole pages through this trait; it
/// never talks to the network. A missing entry is a normal condition, never
/// an error.
pub trait CacheStore<R: Record>: Send + Sync {
  /// Get the cached page stored under exactly this key.
  fn get_entry(&self, key: &QueryKey) -> Option<CachedPage<R>>;

  /// Store a page, replacing any previous entry for the key.
  fn set_entry(&self, key: &QueryKey, page: CachedPage<R>);

  /// All entries whose key starts with `prefix`. An empty prefix lists nothing.
  fn list_entries_by_prefix(&self, prefix: &QueryKey) -> Vec<(QueryKey, CachedPage<R>)>;
}

/// Store that doesn't cache anything.
/// Every lookup misses and writes are discarded.
pub struct NoopStore;

impl<R: Record> CacheStore<R> for NoopStore {
  fn get_entry(&self, _key: &QueryKey) -> Option<CachedPage<R>> {
    None
  }

  fn set_entry(&self, _key: &QueryKey, _page: CachedPage<R>) {}

  fn list_entries_by_prefix(&self, _prefix: &QueryKey) -> Vec<(QueryKey, CachedPage<R>)> {
    Vec::new()
  }
}

#[derive(Debug, Clone)]
struct StoredPage<R> {
  key: QueryKey,
  page: CachedPage<R>,
  cached_at: DateTime<Utc>,
}

/// Process-local store keyed by the canonical form of the query key.
pub struct MemoryStore<R> {
  entries: Mutex<BTreeMap<String, StoredPage<R>>>,
}

impl<R: Record> MemoryStore<R> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
    }
  }

  /// When the entry for `key` was last written.
  pub fn cached_at(&self, key: &QueryKey) -> Option<DateTime<Utc>> {
    lock(&self.entries)
      .get(&key.description())
      .map(|stored| stored.cached_at)
  }

  pub fn remove_entry(&self, key: &QueryKey) -> Option<CachedPage<R>> {
    lock(&self.entries)
      .remove(&key.description())
      .map(|stored| stored.page)
  }

  pub fn len(&self) -> usize {
    lock(&self.entries).len()
  }

  pub fn is_empty(&self) -> bool {
    lock(&self.entries).is_empty()
  }

  pub fn clear(&self) {
    lock(&self.entries).clear();
  }
}

impl<R: Record> Default for MemoryStore<R> {
  fn default() -> Self {
    Self::new()
  }
}

impl<R: Record> CacheStore<R> for MemoryStore<R> {
  fn get_entry(&self, key: &QueryKey) -> Option<CachedPage<R>> {
    lock(&self.entries)
      .get(&key.description())
      .map(|stored| stored.page.clone())
  }

  fn set_entry(&self, key: &QueryKey, page: CachedPage<R>) {
    lock(&self.entries).insert(
      key.description(),
      StoredPage {
        key: key.clone(),
        page,
        cached_at: Utc::now(),
      },
    );
  }

  fn list_entries_by_prefix(&self, prefix: &QueryKey) -> Vec<(QueryKey, CachedPage<R>)> {
    lock(&self.entries)
      .values()
      .filter(|stored| prefix.is_prefix_of(&stored.key))
      .map(|stored| (stored.key.clone(), stored.page.clone()))
      .collect()
  }
}
