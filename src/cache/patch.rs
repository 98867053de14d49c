//! Projects a single push event into already materialized list pages.
//!
//! Each cached page is patched independently from its own parameters, so a
//! record moving between partitions needs no special handling: pages scoped
//! to the old partition see a removal, pages scoped to the new partition see
//! a candidate insertion.
//!
//! Known limitation: a new matching record is only inserted into first pages.
//! Placing it correctly on page N would need the rows of pages 1..N-1, which
//! only a real fetch can provide.

use tracing::debug;

use super::predicate::record_matches;
use super::storage::CacheStore;
use super::traits::{CachedPage, Partition, Record, RecordId};
use crate::event::PushEvent;
use crate::key::QueryKey;

/// What happened to one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageChange {
  Unchanged,
  /// An existing row was replaced with the incoming record
  Replaced,
  /// A new row was inserted at the head; `trimmed` when the last row fell off
  Inserted { trimmed: bool },
  /// A row was removed and the total decremented
  Removed,
}

impl PageChange {
  pub fn is_changed(self) -> bool {
    self != PageChange::Unchanged
  }
}

/// Summary of one patch batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
  /// Keys of the pages that were modified, in store order
  pub changed_keys: Vec<QueryKey>,
  pub replaced: usize,
  pub inserted: usize,
  pub removed: usize,
  pub trimmed: usize,
  /// Pages skipped because their key carries no decodable list parameters
  pub skipped: usize,
}

impl PatchReport {
  pub fn is_changed(&self) -> bool {
    !self.changed_keys.is_empty()
  }

  fn record(&mut self, key: &QueryKey, change: PageChange) {
    match change {
      PageChange::Unchanged => return,
      PageChange::Replaced => self.replaced += 1,
      PageChange::Inserted { trimmed } => {
        self.inserted += 1;
        if trimmed {
          self.trimmed += 1;
        }
      }
      PageChange::Removed => self.removed += 1,
    }
    self.changed_keys.push(key.clone());
  }
}

/// Pages after a patch, together with what changed.
#[derive(Debug, Clone)]
pub struct Patched<R> {
  pub pages: Vec<(QueryKey, CachedPage<R>)>,
  pub report: PatchReport,
}

/// Apply an upsert to one page whose view parameters are known.
pub fn upsert_into_page<R: Record>(
  key: &QueryKey,
  page: &mut CachedPage<R>,
  record: &R,
) -> Option<PageChange> {
  let params = key.list_params()?;
  let should_include = record_matches(&params, record);
  let id = record.record_id();

  let change = match page.position(&id) {
    Some(index) if should_include => {
      if page.rows[index] == *record {
        PageChange::Unchanged
      } else {
        page.rows[index] = record.clone();
        PageChange::Replaced
      }
    }
    Some(index) => {
      page.rows.remove(index);
      page.total = page.total.saturating_sub(1);
      PageChange::Removed
    }
    None if should_include && page.is_first_page() => {
      page.rows.insert(0, record.clone());
      page.total += 1;
      let trimmed = page.limit > 0 && page.rows.len() as u64 > page.limit;
      if trimmed {
        page.rows.truncate(page.limit as usize);
      }
      PageChange::Inserted { trimmed }
    }
    None => PageChange::Unchanged,
  };

  if change.is_changed() {
    page.recompute_total_pages();
  }
  Some(change)
}

/// Remove a row by id from one page.
pub fn remove_from_page<R: Record>(page: &mut CachedPage<R>, id: &RecordId) -> PageChange {
  match page.position(id) {
    Some(index) => {
      page.rows.remove(index);
      page.total = page.total.saturating_sub(1);
      page.recompute_total_pages();
      PageChange::Removed
    }
    None => PageChange::Unchanged,
  }
}

/// Project an upsert into every cached page.
///
/// `previous_partition` is informational: the per-page predicate already
/// yields removal from the old partition and insertion into the new one.
pub fn apply_upsert<R: Record>(
  pages: Vec<(QueryKey, CachedPage<R>)>,
  record: &R,
  previous_partition: Option<Partition>,
) -> Patched<R> {
  let current = record.partition();
  if let Some(previous) = previous_partition.filter(|p| *p != current) {
    debug!(id = %record.record_id(), ?previous, ?current, "record moved between partitions");
  }

  let mut report = PatchReport::default();
  let pages = pages
    .into_iter()
    .map(|(key, mut page)| {
      match upsert_into_page(&key, &mut page, record) {
        Some(change) => report.record(&key, change),
        None => report.skipped += 1,
      }
      (key, page)
    })
    .collect();

  Patched { pages, report }
}

/// Remove a destroyed record from every cached page containing it.
pub fn apply_remove<R: Record>(pages: Vec<(QueryKey, CachedPage<R>)>, id: &RecordId) -> Patched<R> {
  let mut report = PatchReport::default();
  let pages = pages
    .into_iter()
    .map(|(key, mut page)| {
      let change = remove_from_page(&mut page, id);
      report.record(&key, change);
      (key, page)
    })
    .collect();

  Patched { pages, report }
}

pub fn apply_event<R: Record>(
  pages: Vec<(QueryKey, CachedPage<R>)>,
  event: &PushEvent<R>,
) -> Patched<R> {
  match event {
    PushEvent::Upsert {
      record,
      previous_partition,
    } => apply_upsert(pages, record, *previous_partition),
    PushEvent::Remove { id, partition } => {
      debug!(%id, ?partition, "removing destroyed record");
      apply_remove(pages, id)
    }
  }
}

/// Patch every entry of `resource` held in `store`, writing back only the
/// pages that changed.
pub fn patch_store<R, S>(store: &S, resource: &QueryKey, event: &PushEvent<R>) -> PatchReport
where
  R: Record,
  S: CacheStore<R> + ?Sized,
{
  let entries = store.list_entries_by_prefix(resource);
  if entries.is_empty() {
    return PatchReport::default();
  }

  let Patched { pages, report } = apply_event(entries, event);
  for (key, page) in pages {
    if report.changed_keys.contains(&key) {
      store.set_entry(&key, page);
    }
  }

  debug!(
    resource = %resource,
    changed = report.changed_keys.len(),
    replaced = report.replaced,
    inserted = report.inserted,
    removed = report.removed,
    "patched cached pages"
  );
  report
}
