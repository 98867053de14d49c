//! Cached list pages and the patch engine that keeps them current.
//!
//! This module provides:
//! - The [`Record`] trait rows must implement, and the [`CachedPage`] shape
//! - A [`CacheStore`] abstraction over wherever pages are materialized
//! - Local search/filter/status predicates
//! - The patch engine projecting push events into cached pages without a re-fetch

mod patch;
mod predicate;
mod storage;
mod traits;

pub use patch::{
  apply_event, apply_remove, apply_upsert, patch_store, remove_from_page, upsert_into_page,
  PageChange, PatchReport, Patched,
};
pub use predicate::{filters_match, record_matches, search_matches};
pub use storage::{CacheStore, MemoryStore, NoopStore};
pub use traits::{total_pages_for, CachedPage, Partition, Record, RecordId};
