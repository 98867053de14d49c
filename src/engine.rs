//! Composition root wiring one registry, one cache store and one clock.
//!
//! An application builds a single [`SyncEngine`] at startup, mounts a
//! [`RefreshCoordinator`] per paginated view through it, and calls
//! [`SyncEngine::shutdown`] on teardown.

use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{patch_store, CacheStore, PatchReport, Record};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::coordinator::{DebouncePolicy, RefreshCoordinator};
use crate::event::{MutationOutcome, PushEvent};
use crate::key::QueryKey;
use crate::registry::{RefreshRegistry, RegistryPolicy, TriggerOutcome};

pub struct SyncEngine<R, S> {
  registry: Arc<RefreshRegistry>,
  store: Arc<S>,
  clock: Arc<dyn Clock>,
  policy: DebouncePolicy,
  _record: PhantomData<fn() -> R>,
}

impl<R, S> SyncEngine<R, S>
where
  R: Record,
  S: CacheStore<R>,
{
  pub fn new(store: Arc<S>, config: &Config) -> Self {
    Self::with_clock(store, config, Arc::new(SystemClock))
  }

  pub fn with_clock(store: Arc<S>, config: &Config, clock: Arc<dyn Clock>) -> Self {
    Self::with_policies(
      store,
      config.registry_policy(),
      config.debounce_policy(),
      clock,
    )
  }

  pub fn with_policies(
    store: Arc<S>,
    registry_policy: RegistryPolicy,
    policy: DebouncePolicy,
    clock: Arc<dyn Clock>,
  ) -> Self {
    info!(?registry_policy, ?policy, "sync engine initialised");
    Self {
      registry: RefreshRegistry::with_clock(registry_policy, Arc::clone(&clock)),
      store,
      clock,
      policy,
      _record: PhantomData,
    }
  }

  pub fn registry(&self) -> &Arc<RefreshRegistry> {
    &self.registry
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  /// Create the coordinator for a newly mounted view. It subscribes once its
  /// data loader reports ready through [`RefreshCoordinator::on_ready`].
  pub fn mount(&self, key: QueryKey, label: impl Into<String>) -> RefreshCoordinator {
    RefreshCoordinator::new(
      key,
      label,
      Arc::clone(&self.registry),
      Arc::clone(&self.clock),
      self.policy.clone(),
    )
  }

  /// Refresh the views affected by a completed local mutation.
  pub fn notify_mutation(&self, outcome: &MutationOutcome) -> Vec<TriggerOutcome> {
    let mut results = vec![self.registry.trigger_refresh(&outcome.all_query_key)];
    if let Some(detail) = &outcome.detail_query_key {
      results.push(self.registry.trigger_refresh(detail));
    }
    results
  }

  /// Patch the store for a push event without going through a view.
  pub fn apply_push(&self, resource: &str, event: &PushEvent<R>) -> PatchReport {
    patch_store(self.store.as_ref(), &QueryKey::resource(resource), event)
  }

  /// Deliver a push event to the mounted views of its resource. The store is
  /// patched once; every view whose own page changed bumps its version and
  /// requests a version-driven refresh, once per event.
  pub fn dispatch_push(
    &self,
    resource: &str,
    event: &PushEvent<R>,
    views: &[&RefreshCoordinator],
  ) -> PatchReport {
    let resource_key = QueryKey::resource(resource);
    let report = patch_store(self.store.as_ref(), &resource_key, event);
    let bumped = views
      .iter()
      .filter(|view| resource_key.is_prefix_of(&view.query_key()))
      .filter(|view| view.observe_patch(&report))
      .count();
    debug!(resource, changed = report.changed_keys.len(), bumped, "push dispatched");
    report
  }

  /// Drop every subscription.
  pub fn shutdown(&self) {
    self.registry.clear();
    info!("sync engine shut down");
  }
}
