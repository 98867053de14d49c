use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use color_eyre::Result;
use pagesync::event::push_channel;
use pagesync::{
  CacheStore, CachedPage, Config, ListParams, ManualClock, MemoryStore, Partition, PushEvent,
  QueryKey, RecordId, RefreshFn, StatusFilter, SyncEngine, TriggerOutcome,
};
use serde_json::{json, Value};

type Engine = SyncEngine<Value, MemoryStore<Value>>;

fn setup() -> (Engine, Arc<ManualClock>) {
  let clock = Arc::new(ManualClock::new());
  let engine = SyncEngine::with_clock(Arc::new(MemoryStore::new()), &Config::default(), clock.clone());
  (engine, clock)
}

fn counter() -> (Arc<AtomicUsize>, RefreshFn) {
  let count = Arc::new(AtomicUsize::new(0));
  let c = count.clone();
  let callback: RefreshFn = Arc::new(move || -> Result<()> {
    c.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });
  (count, callback)
}

fn tag(id: u64) -> Value {
  json!({ "id": id, "name": format!("tag {id}") })
}

fn first_page_key() -> QueryKey {
  QueryKey::list("tags", &ListParams::new(1, 10).with_status(StatusFilter::Active))
}

fn seed_first_page(engine: &Engine) {
  let rows = (16..=25).rev().map(tag).collect();
  engine
    .store()
    .set_entry(&first_page_key(), CachedPage::new(rows, 1, 10, 25));
}

#[test]
fn test_new_record_then_removal_on_first_page() {
  let (engine, clock) = setup();
  seed_first_page(&engine);
  let view = engine.mount(first_page_key(), "tags-page-1");
  let (refreshes, callback) = counter();
  view.on_ready(callback);

  let report = engine.dispatch_push("tags", &PushEvent::upsert(tag(26)), &[&view]);
  assert_eq!(report.inserted, 1);
  assert_eq!(report.trimmed, 1);

  let page = engine.store().get_entry(&first_page_key()).unwrap();
  assert_eq!(page.rows.len(), 10);
  assert_eq!(page.rows[0], tag(26));
  assert!(!page.contains(&RecordId::from(16u64)));
  assert_eq!((page.total, page.total_pages), (26, 3));
  assert_eq!(view.cache_version(), 1);
  assert_eq!(refreshes.load(Ordering::SeqCst), 1);

  clock.advance_ms(100);
  let report = engine.dispatch_push("tags", &PushEvent::remove(20u64, Partition::Active), &[&view]);
  assert_eq!(report.removed, 1);

  let page = engine.store().get_entry(&first_page_key()).unwrap();
  assert_eq!(page.rows.len(), 9);
  assert!(!page.contains(&RecordId::from(20u64)));
  assert_eq!((page.total, page.total_pages), (25, 3));
  assert_eq!(view.cache_version(), 2);
  assert_eq!(refreshes.load(Ordering::SeqCst), 2);
}

#[test]
fn test_coarse_trigger_reaches_active_and_deleted_views_once() {
  let (engine, _) = setup();
  let active = engine.mount(QueryKey::resource("tags"), "tags");
  let deleted = engine.mount(
    QueryKey::new(vec![json!("tags"), json!({ "status": "deleted" })]),
    "tags-deleted",
  );
  let (active_count, active_cb) = counter();
  let (deleted_count, deleted_cb) = counter();
  active.on_ready(active_cb);
  deleted.on_ready(deleted_cb);

  let outcome = engine.registry().trigger_refresh(&QueryKey::resource("tags"));

  assert_eq!(outcome, TriggerOutcome::Matched { notified: 2, failed: 0 });
  assert_eq!(active_count.load(Ordering::SeqCst), 1);
  assert_eq!(deleted_count.load(Ordering::SeqCst), 1);
  assert_eq!(
    engine.registry().trigger_refresh(&QueryKey::resource("tags")),
    TriggerOutcome::Debounced
  );
}

#[test]
fn test_soft_delete_moves_row_between_partition_views() {
  let (engine, _) = setup();
  seed_first_page(&engine);
  let trash_key = QueryKey::list("tags", &ListParams::new(1, 10).with_status(StatusFilter::Deleted));
  engine
    .store()
    .set_entry(&trash_key, CachedPage::new(Vec::new(), 1, 10, 0));
  let active = engine.mount(first_page_key(), "tags");
  let trash = engine.mount(trash_key.clone(), "tags-trash");
  let (active_refreshes, active_cb) = counter();
  let (trash_refreshes, trash_cb) = counter();
  active.on_ready(active_cb);
  trash.on_ready(trash_cb);

  let mut deleted = tag(22);
  deleted["deleted_at"] = json!("2024-06-01T00:00:00Z");
  let event = PushEvent::moved(deleted.clone(), Partition::Active);
  let report = engine.dispatch_push("tags", &event, &[&active, &trash]);

  assert_eq!(report.removed, 1);
  assert_eq!(report.inserted, 1);
  let active_page = engine.store().get_entry(&first_page_key()).unwrap();
  assert!(!active_page.contains(&RecordId::from(22u64)));
  assert_eq!(active_page.total, 24);
  let trash_page = engine.store().get_entry(&trash_key).unwrap();
  assert_eq!(trash_page.rows, vec![deleted]);
  assert_eq!((trash_page.total, trash_page.total_pages), (1, 1));

  assert_eq!(active.cache_version(), 1);
  assert_eq!(trash.cache_version(), 1);
  assert_eq!(active_refreshes.load(Ordering::SeqCst), 1);
  assert_eq!(trash_refreshes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_push_reaches_first_page_even_when_listed_last() {
  let (engine, _) = setup();
  seed_first_page(&engine);
  let page2_key = QueryKey::list("tags", &ListParams::new(2, 10).with_status(StatusFilter::Active));
  let page1 = engine.mount(first_page_key(), "tags-page-1");
  let page2 = engine.mount(page2_key, "tags-page-2");
  let (page1_refreshes, page1_cb) = counter();
  let (page2_refreshes, page2_cb) = counter();
  page1.on_ready(page1_cb);
  page2.on_ready(page2_cb);

  engine.dispatch_push("tags", &PushEvent::upsert(tag(26)), &[&page2, &page1]);

  assert_eq!(page1.cache_version(), 1);
  assert_eq!(page1_refreshes.load(Ordering::SeqCst), 1);
  assert_eq!(page2.cache_version(), 0);
  assert_eq!(page2_refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_push_channel_feeds_dispatch() {
  let (engine, _) = setup();
  seed_first_page(&engine);
  let view = engine.mount(first_page_key(), "tags");
  let (tx, mut rx) = push_channel::<Value>();

  tokio::spawn(async move {
    tx.send("tags", PushEvent::upsert(json!({ "id": 17, "name": "renamed" })))
      .unwrap();
  });

  let envelope = rx.next().await.unwrap();
  let report = engine.dispatch_push(&envelope.resource, &envelope.event, &[&view]);

  assert_eq!(report.replaced, 1);
  let page = engine.store().get_entry(&first_page_key()).unwrap();
  assert_eq!(page.rows[8]["name"], "renamed");
  assert_eq!(page.total, 25);
  // the view was never ready; the refresh waits for it
  assert!(view.is_pending());
}
