//! Subscription table translating "this key changed" into "refresh these views".
//!
//! Views register a refresh callback under their query key. A trigger finds
//! the matching subscriptions in three widening passes:
//!
//! 1. exact or prefix match on the key (either direction)
//! 2. same resource, when no key matched
//! 3. every subscription, when the resource is unknown as well
//!
//! The last pass trades unnecessary re-renders for never silently dropping a
//! refresh. It is counted and reported through an optional hook so a key
//! shape mismatch elsewhere shows up quickly.

use color_eyre::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::debounce::Debounce;
use crate::key::{matches, same_resource, QueryKey};
use crate::utils::lock;

/// A view's refresh entry point.
pub type RefreshFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Called with the triggering key whenever the fallback-to-all pass fires.
pub type FallbackHook = Arc<dyn Fn(&QueryKey) + Send + Sync>;

/// Run one callback in isolation. Errors and panics are logged and reported
/// as `false`; they never reach the caller.
pub(crate) fn run_callback(owner: &str, callback: &RefreshFn) -> bool {
  match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
    Ok(Ok(())) => true,
    Ok(Err(e)) => {
      warn!(owner, error = %e, "refresh callback failed");
      false
    }
    Err(_) => {
      warn!(owner, "refresh callback panicked");
      false
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPolicy {
  /// Triggers for the same serialized key inside this window are coalesced
  pub debounce: Duration,
}

impl Default for RegistryPolicy {
  fn default() -> Self {
    Self {
      debounce: Duration::from_millis(50),
    }
  }
}

impl RegistryPolicy {
  pub fn with_debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce;
    self
  }
}

/// Result of one trigger call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
  /// Same key triggered inside the debounce window; nothing ran
  Debounced,
  /// Key was empty; nothing ran
  Ignored,
  /// No subscriptions exist at all
  NoSubscribers,
  /// Callbacks matched by key or by resource
  Matched { notified: usize, failed: usize },
  /// Nothing matched, so every callback ran
  Fallback { notified: usize, failed: usize },
}

impl TriggerOutcome {
  pub fn notified(&self) -> usize {
    match self {
      TriggerOutcome::Matched { notified, .. } | TriggerOutcome::Fallback { notified, .. } => {
        *notified
      }
      _ => 0,
    }
  }
}

/// Snapshot of registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
  pub triggers: u64,
  pub debounced: u64,
  pub fallbacks: u64,
  pub callbacks_run: u64,
  pub callbacks_failed: u64,
  /// Subscriptions currently registered
  pub subscriptions: u64,
}

#[derive(Default)]
struct Counters {
  triggers: AtomicU64,
  debounced: AtomicU64,
  fallbacks: AtomicU64,
  callbacks_run: AtomicU64,
  callbacks_failed: AtomicU64,
}

struct Subscriber {
  id: u64,
  owner: String,
  callback: RefreshFn,
}

struct Bucket {
  key: QueryKey,
  subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct RegistryState {
  /// Buckets by key hash; a bucket exists only while it has subscribers
  buckets: HashMap<String, Bucket>,
  /// Per-key debounce gates, pruned once idle
  gates: HashMap<String, Debounce>,
  next_id: u64,
}

impl RegistryState {
  fn subscription_count(&self) -> usize {
    self.buckets.values().map(|b| b.subscribers.len()).sum()
  }

  /// Matching subscribers in registration order.
  fn collect<F>(&self, pred: F) -> Vec<(u64, String, RefreshFn)>
  where
    F: Fn(&QueryKey) -> bool,
  {
    let mut found: Vec<_> = self
      .buckets
      .values()
      .filter(|bucket| pred(&bucket.key))
      .flat_map(|bucket| bucket.subscribers.iter())
      .map(|s| (s.id, s.owner.clone(), Arc::clone(&s.callback)))
      .collect();
    found.sort_by_key(|(id, _, _)| *id);
    found
  }
}

/// Subscription table shared by every mounted view of an application.
///
/// Constructed once by the composition root and handed to coordinators as an
/// `Arc`; [`RefreshRegistry::clear`] tears it down.
pub struct RefreshRegistry {
  state: Mutex<RegistryState>,
  clock: Arc<dyn Clock>,
  policy: RegistryPolicy,
  counters: Counters,
  fallback_hook: Mutex<Option<FallbackHook>>,
}

impl RefreshRegistry {
  pub fn new(policy: RegistryPolicy) -> Arc<Self> {
    Self::with_clock(policy, Arc::new(SystemClock))
  }

  pub fn with_clock(policy: RegistryPolicy, clock: Arc<dyn Clock>) -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(RegistryState::default()),
      clock,
      policy,
      counters: Counters::default(),
      fallback_hook: Mutex::new(None),
    })
  }

  pub fn policy(&self) -> &RegistryPolicy {
    &self.policy
  }

  /// Install a hook observing every fallback-to-all trigger.
  pub fn set_fallback_hook(&self, hook: FallbackHook) {
    *lock(&self.fallback_hook) = Some(hook);
  }

  /// Add a subscription. The returned handle removes exactly this one.
  pub fn register(
    self: &Arc<Self>,
    key: QueryKey,
    callback: RefreshFn,
    owner: impl Into<String>,
  ) -> Registration {
    let owner = owner.into();
    let bucket_id = key.cache_hash();
    let mut state = lock(&self.state);
    state.next_id += 1;
    let id = state.next_id;

    let bucket = state.buckets.entry(bucket_id.clone()).or_insert_with(|| {
      debug!(key = %key, "creating subscription bucket");
      Bucket {
        key: key.clone(),
        subscribers: Vec::new(),
      }
    });
    bucket.subscribers.push(Subscriber {
      id,
      owner: owner.clone(),
      callback,
    });
    debug!(key = %key, owner = %owner, id, "registered refresh callback");

    Registration {
      registry: Arc::downgrade(self),
      bucket_id,
      key,
      id,
    }
  }

  /// Remove one subscription. Returns false if it was already gone.
  fn unregister(&self, bucket_id: &str, id: u64) -> bool {
    let mut state = lock(&self.state);
    let Some(bucket) = state.buckets.get_mut(bucket_id) else {
      return false;
    };
    let before = bucket.subscribers.len();
    bucket.subscribers.retain(|s| s.id != id);
    let removed = bucket.subscribers.len() != before;
    if bucket.subscribers.is_empty() {
      debug!(key = %bucket.key, "removing empty subscription bucket");
      state.buckets.remove(bucket_id);
    }
    removed
  }

  /// Refresh every view whose key matches `key`.
  ///
  /// Callbacks run outside the registry lock, in registration order, each
  /// one isolated from the failures of the others.
  pub fn trigger_refresh(&self, key: &QueryKey) -> TriggerOutcome {
    if key.is_empty() {
      warn!("ignoring refresh trigger with an empty key");
      return TriggerOutcome::Ignored;
    }

    let now = self.clock.now();
    let hash = key.cache_hash();
    let (targets, fallback) = {
      let mut state = lock(&self.state);
      state.gates.retain(|_, gate| {
        gate.settle(now);
        !gate.is_idle()
      });

      let gate = state.gates.entry(hash).or_default();
      if !gate.try_pass(now, self.policy.debounce) {
        self.counters.debounced.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "refresh trigger debounced");
        return TriggerOutcome::Debounced;
      }
      self.counters.triggers.fetch_add(1, Ordering::Relaxed);

      if state.buckets.is_empty() {
        debug!(key = %key, "refresh trigger with no subscribers");
        return TriggerOutcome::NoSubscribers;
      }

      let mut targets = state.collect(|candidate| matches(candidate, key));
      if targets.is_empty() {
        targets = state.collect(|candidate| same_resource(candidate, key));
      }
      let fallback = targets.is_empty();
      if fallback {
        targets = state.collect(|_| true);
      }
      (targets, fallback)
    };

    if fallback {
      self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
      warn!(key = %key, subscribers = targets.len(), "no subscription matched, refreshing all views");
      let hook = lock(&self.fallback_hook).clone();
      if let Some(hook) = hook {
        if panic::catch_unwind(AssertUnwindSafe(|| hook(key))).is_err() {
          warn!(key = %key, "fallback hook panicked");
        }
      }
    }

    let notified = targets.len();
    let mut failed = 0;
    for (_, owner, callback) in &targets {
      self.counters.callbacks_run.fetch_add(1, Ordering::Relaxed);
      if !run_callback(owner, callback) {
        self.counters.callbacks_failed.fetch_add(1, Ordering::Relaxed);
        failed += 1;
      }
    }
    debug!(key = %key, notified, failed, "refresh triggered");

    if fallback {
      TriggerOutcome::Fallback { notified, failed }
    } else {
      TriggerOutcome::Matched { notified, failed }
    }
  }

  /// Drop every subscription and debounce gate.
  pub fn clear(&self) {
    let mut state = lock(&self.state);
    let dropped = state.subscription_count();
    state.buckets.clear();
    state.gates.clear();
    info!(dropped, "refresh registry cleared");
  }

  pub fn subscription_count(&self) -> usize {
    lock(&self.state).subscription_count()
  }

  pub fn bucket_count(&self) -> usize {
    lock(&self.state).buckets.len()
  }

  /// Number of fallback-to-all triggers so far.
  pub fn fallback_count(&self) -> u64 {
    self.counters.fallbacks.load(Ordering::Relaxed)
  }

  pub fn stats(&self) -> RegistryStats {
    RegistryStats {
      triggers: self.counters.triggers.load(Ordering::Relaxed),
      debounced: self.counters.debounced.load(Ordering::Relaxed),
      fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
      callbacks_run: self.counters.callbacks_run.load(Ordering::Relaxed),
      callbacks_failed: self.counters.callbacks_failed.load(Ordering::Relaxed),
      subscriptions: self.subscription_count() as u64,
    }
  }
}

impl fmt::Debug for RefreshRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RefreshRegistry")
      .field("policy", &self.policy)
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}

/// Capability to remove one subscription.
///
/// Dropping the handle does not unregister; call [`Registration::unregister`].
#[must_use = "dropping a Registration leaves the subscription registered"]
#[derive(Debug)]
pub struct Registration {
  registry: Weak<RefreshRegistry>,
  bucket_id: String,
  key: QueryKey,
  id: u64,
}

impl Registration {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Remove the subscription. A no-op if the registry is gone or was cleared.
  pub fn unregister(self) -> bool {
    match self.registry.upgrade() {
      Some(registry) => {
        let removed = registry.unregister(&self.bucket_id, self.id);
        debug!(key = %self.key, id = self.id, removed, "unregistered refresh callback");
        removed
      }
      None => false,
    }
  }
}
