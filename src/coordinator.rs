//! Per-view refresh arbitration.
//!
//! A mounted list view can be asked to refresh from three directions:
//!
//! - the registry, after a local mutation succeeded
//! - an observed cache invalidation
//! - a cache-version bump after a push event was patched into the cache
//!
//! One logical change often arrives through more than one of these. The
//! coordinator collapses them into at most one visible refresh using three
//! debounce gates. Invalidation and registry refreshes are authoritative and
//! suppress version-driven ones for `invalidation_suppresses_version`; a
//! version-driven refresh suppresses invalidation-driven ones for
//! `version_suppresses_invalidation`.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::cache::{patch_store, CacheStore, PatchReport, Record};
use crate::clock::Clock;
use crate::debounce::Debounce;
use crate::event::PushEvent;
use crate::key::QueryKey;
use crate::registry::{run_callback, RefreshFn, RefreshRegistry, Registration};
use crate::utils::lock;

/// Debounce windows applied by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebouncePolicy {
  /// Repeated requests from the same source inside this window collapse
  pub repeat: Duration,
  pub invalidation_suppresses_version: Duration,
  pub version_suppresses_invalidation: Duration,
}

impl Default for DebouncePolicy {
  fn default() -> Self {
    Self {
      repeat: Duration::from_millis(50),
      invalidation_suppresses_version: Duration::from_millis(2000),
      version_suppresses_invalidation: Duration::from_millis(6000),
    }
  }
}

impl DebouncePolicy {
  pub fn with_repeat(mut self, window: Duration) -> Self {
    self.repeat = window;
    self
  }

  pub fn with_invalidation_suppresses_version(mut self, window: Duration) -> Self {
    self.invalidation_suppresses_version = window;
    self
  }

  pub fn with_version_suppresses_invalidation(mut self, window: Duration) -> Self {
    self.version_suppresses_invalidation = window;
    self
  }
}

/// Where a refresh request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
  Registry,
  Invalidation,
  CacheVersion,
}

/// What a refresh request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
  Refreshed,
  /// The callback ran but failed; the failure was logged
  Failed,
  /// Dropped by a debounce window
  Suppressed,
  /// The view is not ready yet; the refresh runs once it is
  Pending,
}

struct CoordinatorState {
  key: QueryKey,
  refresh: Option<RefreshFn>,
  /// Strongest trigger requested before the view was ready
  pending: Option<RefreshTrigger>,
  registration: Option<Registration>,
  registry_gate: Debounce,
  invalidation_gate: Debounce,
  version_gate: Debounce,
  cache_version: u64,
  refresh_count: u64,
}

impl CoordinatorState {
  fn gate(&mut self, trigger: RefreshTrigger) -> &mut Debounce {
    match trigger {
      RefreshTrigger::Registry => &mut self.registry_gate,
      RefreshTrigger::Invalidation => &mut self.invalidation_gate,
      RefreshTrigger::CacheVersion => &mut self.version_gate,
    }
  }
}

struct CoordinatorInner {
  label: String,
  registry: Arc<RefreshRegistry>,
  clock: Arc<dyn Clock>,
  policy: DebouncePolicy,
  state: Mutex<CoordinatorState>,
}

impl CoordinatorInner {
  /// Decide whether a request should run, updating the gates if so.
  fn admit(&self, trigger: RefreshTrigger) -> Result<RefreshFn, RefreshOutcome> {
    let mut state = lock(&self.state);
    let Some(refresh) = state.refresh.clone() else {
      if !matches!(state.pending, Some(held) if held != RefreshTrigger::CacheVersion) {
        state.pending = Some(trigger);
      }
      debug!(view = %self.label, ?trigger, "refresh requested before view is ready");
      return Err(RefreshOutcome::Pending);
    };

    let now = self.clock.now();
    if !state.gate(trigger).try_pass(now, self.policy.repeat) {
      debug!(view = %self.label, ?trigger, "refresh suppressed");
      return Err(RefreshOutcome::Suppressed);
    }
    self.suppress_others(&mut state, trigger, now);
    state.refresh_count += 1;
    Ok(refresh)
  }

  fn suppress_others(&self, state: &mut CoordinatorState, trigger: RefreshTrigger, now: Instant) {
    let policy = &self.policy;
    match trigger {
      RefreshTrigger::Registry => {
        state.invalidation_gate.suppress(now, policy.repeat);
        state
          .version_gate
          .suppress(now, policy.invalidation_suppresses_version);
      }
      RefreshTrigger::Invalidation => {
        state.registry_gate.suppress(now, policy.repeat);
        state
          .version_gate
          .suppress(now, policy.invalidation_suppresses_version);
      }
      RefreshTrigger::CacheVersion => {
        state
          .invalidation_gate
          .suppress(now, policy.version_suppresses_invalidation);
      }
    }
  }

  fn refresh(&self, trigger: RefreshTrigger) -> RefreshOutcome {
    match self.admit(trigger) {
      Ok(refresh) => {
        if run_callback(&self.label, &refresh) {
          RefreshOutcome::Refreshed
        } else {
          RefreshOutcome::Failed
        }
      }
      Err(outcome) => outcome,
    }
  }
}

/// Refresh controller for one mounted paginated view.
///
/// Dropping the coordinator unmounts the view: its registry subscription is
/// revoked.
pub struct RefreshCoordinator {
  inner: Arc<CoordinatorInner>,
}

impl RefreshCoordinator {
  pub fn new(
    key: QueryKey,
    label: impl Into<String>,
    registry: Arc<RefreshRegistry>,
    clock: Arc<dyn Clock>,
    policy: DebouncePolicy,
  ) -> Self {
    let inner = CoordinatorInner {
      label: label.into(),
      registry,
      clock,
      policy,
      state: Mutex::new(CoordinatorState {
        key,
        refresh: None,
        pending: None,
        registration: None,
        registry_gate: Debounce::Idle,
        invalidation_gate: Debounce::Idle,
        version_gate: Debounce::Idle,
        cache_version: 0,
        refresh_count: 0,
      }),
    };
    Self {
      inner: Arc::new(inner),
    }
  }

  pub fn label(&self) -> &str {
    &self.inner.label
  }

  pub fn query_key(&self) -> QueryKey {
    lock(&self.inner.state).key.clone()
  }

  pub fn is_ready(&self) -> bool {
    lock(&self.inner.state).refresh.is_some()
  }

  pub fn is_pending(&self) -> bool {
    lock(&self.inner.state).pending.is_some()
  }

  /// Monotonic count of push-driven cache changes seen by this view.
  pub fn cache_version(&self) -> u64 {
    lock(&self.inner.state).cache_version
  }

  /// How many times the view's refresh callback was invoked.
  pub fn refresh_count(&self) -> u64 {
    lock(&self.inner.state).refresh_count
  }

  /// The view's data loader is ready: store its refresh callback, run any
  /// refresh requested in the meantime, and subscribe under the current key.
  ///
  /// Returns the outcome of the pending refresh, if there was one. The
  /// pending refresh passes through the gate of the trigger that requested
  /// it, so it suppresses followers exactly like a live request would.
  pub fn on_ready(&self, refresh: RefreshFn) -> Option<RefreshOutcome> {
    let pending = {
      let mut state = lock(&self.inner.state);
      state.refresh = Some(refresh);
      state.pending.take()
    };
    self.sync_registration();

    let trigger = pending?;
    debug!(view = %self.inner.label, ?trigger, "running pending refresh");
    Some(self.inner.refresh(trigger))
  }

  /// Point the view at a new key, e.g. after a page or filter change.
  pub fn set_query_key(&self, key: QueryKey) {
    {
      let mut state = lock(&self.inner.state);
      if state.key == key {
        return;
      }
      state.key = key;
    }
    self.sync_registration();
  }

  /// Make the registry subscription match the current key. The previous
  /// registration is revoked before the new one is added.
  fn sync_registration(&self) {
    let (key, stale) = {
      let mut state = lock(&self.inner.state);
      if state.refresh.is_none() {
        return;
      }
      let current = state.registration.as_ref().map(Registration::key);
      if current == Some(&state.key) {
        return;
      }
      (state.key.clone(), state.registration.take())
    };

    if let Some(stale) = stale {
      stale.unregister();
    }

    let weak: Weak<CoordinatorInner> = Arc::downgrade(&self.inner);
    let callback: RefreshFn = Arc::new(move || match weak.upgrade() {
      Some(inner) => match inner.admit(RefreshTrigger::Registry) {
        Ok(refresh) => refresh(),
        Err(_) => Ok(()),
      },
      None => Ok(()),
    });
    let registration = self
      .inner
      .registry
      .register(key.clone(), callback, self.inner.label.clone());
    info!(view = %self.inner.label, key = %key, "view subscribed");
    lock(&self.inner.state).registration = Some(registration);
  }

  /// Refresh requested by an observed invalidation or a cache-version bump.
  pub fn soft_refresh(&self, trigger: RefreshTrigger) -> RefreshOutcome {
    self.inner.refresh(trigger)
  }

  /// Project a push event into this view's resource in `store`, then
  /// [`observe_patch`](Self::observe_patch) the result.
  pub fn handle_push<R, S>(&self, store: &S, event: &PushEvent<R>) -> PatchReport
  where
    R: Record,
    S: CacheStore<R> + ?Sized,
  {
    let Some(resource) = self.query_key().resource_key() else {
      return PatchReport::default();
    };
    let report = patch_store(store, &resource, event);
    self.observe_patch(&report);
    report
  }

  /// React to a patch already applied to the cache. When the page under this
  /// view's key changed, the cache version moves by exactly one and a
  /// version-driven soft refresh is requested. Returns whether it moved.
  pub fn observe_patch(&self, report: &PatchReport) -> bool {
    let version = {
      let mut state = lock(&self.inner.state);
      if !report.changed_keys.contains(&state.key) {
        return false;
      }
      state.cache_version += 1;
      state.cache_version
    };
    debug!(view = %self.inner.label, version, "cache version bumped");
    self.soft_refresh(RefreshTrigger::CacheVersion);
    true
  }

  /// Unmount the view.
  pub fn unmount(self) {}
}

impl Drop for RefreshCoordinator {
  fn drop(&mut self) {
    let registration = lock(&self.inner.state).registration.take();
    if let Some(registration) = registration {
      registration.unregister();
      debug!(view = %self.inner.label, "view unmounted");
    }
  }
}

impl fmt::Debug for RefreshCoordinator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = lock(&self.inner.state);
    f.debug_struct("RefreshCoordinator")
      .field("label", &self.inner.label)
      .field("key", &state.key)
      .field("ready", &state.refresh.is_some())
      .field("pending", &state.pending)
      .field("cache_version", &state.cache_version)
      .field("refresh_count", &state.refresh_count)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedPage, MemoryStore, Partition};
  use crate::clock::ManualClock;
  use crate::key::{ListParams, StatusFilter};
  use crate::registry::RegistryPolicy;
  use color_eyre::eyre::eyre;
  use color_eyre::Result;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Fixture {
    clock: Arc<ManualClock>,
    registry: Arc<RefreshRegistry>,
  }

  impl Fixture {
    fn new() -> Self {
      let clock = Arc::new(ManualClock::new());
      let registry = RefreshRegistry::with_clock(RegistryPolicy::default(), clock.clone());
      Self { clock, registry }
    }

    fn view(&self, key: QueryKey) -> RefreshCoordinator {
      RefreshCoordinator::new(
        key,
        "test-view",
        self.registry.clone(),
        self.clock.clone(),
        DebouncePolicy::default(),
      )
    }
  }

  fn counter() -> (Arc<AtomicUsize>, RefreshFn) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let callback: RefreshFn = Arc::new(move || {
      c.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
    (count, callback)
  }

  fn tags_p1() -> QueryKey {
    QueryKey::list("tags", &ListParams::new(1, 10))
  }

  #[test]
  fn test_refresh_before_ready_is_pending() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();

    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Pending);
    assert!(view.is_pending());

    assert_eq!(view.on_ready(cb), Some(RefreshOutcome::Refreshed));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!view.is_pending());
  }

  #[test]
  fn test_pending_refresh_goes_through_its_gate() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();

    view.soft_refresh(RefreshTrigger::Invalidation);
    view.soft_refresh(RefreshTrigger::CacheVersion);
    assert_eq!(view.on_ready(cb), Some(RefreshOutcome::Refreshed));

    assert_eq!(view.soft_refresh(RefreshTrigger::CacheVersion), RefreshOutcome::Suppressed);
    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Suppressed);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(view.refresh_count(), 1);
  }

  #[test]
  fn test_on_ready_without_pending_refresh_runs_nothing() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();

    assert_eq!(view.on_ready(cb), None);
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_on_ready_registers_with_registry() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);

    assert_eq!(fx.registry.subscription_count(), 1);
    fx.registry.trigger_refresh(&QueryKey::resource("tags"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(view.refresh_count(), 1);
  }

  #[test]
  fn test_on_ready_twice_with_same_key_keeps_single_registration() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (_, cb) = counter();
    view.on_ready(cb.clone());
    view.on_ready(cb);
    assert_eq!(fx.registry.subscription_count(), 1);
  }

  #[test]
  fn test_set_query_key_re_registers() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);

    view.set_query_key(QueryKey::list("users", &ListParams::new(1, 10)));
    assert_eq!(fx.registry.subscription_count(), 1);

    fx.registry.trigger_refresh(&QueryKey::list("tags", &ListParams::new(1, 10)));
    assert_eq!(count.load(Ordering::SeqCst), 1, "fallback reaches the only view");
    assert_eq!(fx.registry.fallback_count(), 1);

    fx.clock.advance_ms(100);
    fx.registry.trigger_refresh(&QueryKey::resource("users"));
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(fx.registry.fallback_count(), 1);
  }

  #[test]
  fn test_drop_unregisters() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (_, cb) = counter();
    view.on_ready(cb);
    assert_eq!(fx.registry.subscription_count(), 1);

    view.unmount();
    assert_eq!(fx.registry.subscription_count(), 0);
    assert_eq!(fx.registry.bucket_count(), 0);
  }

  #[test]
  fn test_repeated_soft_refresh_collapses() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);

    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Refreshed);
    fx.clock.advance_ms(10);
    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Suppressed);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    fx.clock.advance_ms(50);
    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Refreshed);
  }

  #[test]
  fn test_invalidation_suppresses_version_for_two_seconds() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);

    view.soft_refresh(RefreshTrigger::Invalidation);
    fx.clock.advance_ms(1999);
    assert_eq!(view.soft_refresh(RefreshTrigger::CacheVersion), RefreshOutcome::Suppressed);

    fx.clock.advance_ms(1);
    assert_eq!(view.soft_refresh(RefreshTrigger::CacheVersion), RefreshOutcome::Refreshed);
    assert_eq!(count.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_version_suppresses_invalidation_for_six_seconds() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);

    view.soft_refresh(RefreshTrigger::CacheVersion);
    fx.clock.advance_ms(5999);
    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Suppressed);

    fx.clock.advance_ms(1);
    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Refreshed);
    assert_eq!(count.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_registry_trigger_suppresses_following_version_bump() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);

    fx.registry.trigger_refresh(&QueryKey::resource("tags"));
    fx.clock.advance_ms(300);
    assert_eq!(view.soft_refresh(RefreshTrigger::CacheVersion), RefreshOutcome::Suppressed);
    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Refreshed);
    assert_eq!(count.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_mutation_success_and_invalidation_render_once() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);

    fx.registry.trigger_refresh(&QueryKey::resource("tags"));
    fx.clock.advance_ms(5);
    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Suppressed);
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_failing_callback_does_not_propagate() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    view.on_ready(Arc::new(|| -> Result<()> { Err(eyre!("fetch failed")) }));

    assert_eq!(view.soft_refresh(RefreshTrigger::Invalidation), RefreshOutcome::Failed);
    assert_eq!(view.refresh_count(), 1);
  }

  #[test]
  fn test_broken_view_does_not_block_sibling() {
    let fx = Fixture::new();
    let broken = fx.view(tags_p1());
    broken.on_ready(Arc::new(|| -> Result<()> { panic!("render crashed") }));
    let sibling = fx.view(QueryKey::list("tags", &ListParams::new(2, 10)));
    let (count, cb) = counter();
    sibling.on_ready(cb);

    let outcome = fx.registry.trigger_refresh(&QueryKey::resource("tags"));
    assert_eq!(outcome.notified(), 2);
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  fn seeded_store() -> MemoryStore<Value> {
    let store = MemoryStore::new();
    let rows = (16..=25).rev().map(|id| json!({ "id": id, "name": "tag" })).collect();
    store.set_entry(&tags_p1(), CachedPage::new(rows, 1, 10, 25));
    store
  }

  #[test]
  fn test_handle_push_bumps_version_once_per_batch() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);
    let store = seeded_store();
    store.set_entry(
      &QueryKey::list("tags", &ListParams::new(1, 5)),
      CachedPage::new(vec![json!({"id": 25, "name": "tag"})], 1, 5, 25),
    );

    let report = view.handle_push(&store, &PushEvent::upsert(json!({"id": 26, "name": "tag"})));

    assert_eq!(report.changed_keys.len(), 2);
    assert_eq!(view.cache_version(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_entry(&tags_p1()).unwrap().total, 26);
  }

  #[test]
  fn test_handle_push_without_change_keeps_version() {
    let fx = Fixture::new();
    let view = fx.view(tags_p1());
    let (count, cb) = counter();
    view.on_ready(cb);
    let store = seeded_store();

    let report = view.handle_push(&store, &PushEvent::<Value>::remove(99u64, Partition::Active));

    assert!(!report.is_changed());
    assert_eq!(view.cache_version(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_handle_push_leaves_view_of_untouched_page_alone() {
    let fx = Fixture::new();
    let page2 = fx.view(QueryKey::list("tags", &ListParams::new(2, 10)));
    let (count, cb) = counter();
    page2.on_ready(cb);
    let store = seeded_store();

    let report = page2.handle_push(&store, &PushEvent::upsert(json!({"id": 26, "name": "tag"})));

    assert_eq!(report.changed_keys, vec![tags_p1()]);
    assert_eq!(page2.cache_version(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_observe_patch_bumps_every_changed_view() {
    let fx = Fixture::new();
    let active = fx.view(tags_p1());
    let trash = fx.view(QueryKey::list("tags", &ListParams::new(1, 10).with_status(StatusFilter::Deleted)));
    let (active_count, active_cb) = counter();
    let (trash_count, trash_cb) = counter();
    active.on_ready(active_cb);
    trash.on_ready(trash_cb);
    let report = PatchReport {
      changed_keys: vec![tags_p1(), trash.query_key()],
      ..PatchReport::default()
    };

    assert!(active.observe_patch(&report));
    assert!(trash.observe_patch(&report));

    assert_eq!((active.cache_version(), trash.cache_version()), (1, 1));
    assert_eq!(active_count.load(Ordering::SeqCst), 1);
    assert_eq!(trash_count.load(Ordering::SeqCst), 1);
  }
}
