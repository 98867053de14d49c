//! Scenario replay against an in-memory reference backend.
//!
//! A scenario seeds a backend with records, mounts paginated views on a
//! [`SyncEngine`] and replays a list of steps on a manual clock. Afterwards
//! every view's cached page is compared with what the backend lists for the
//! same parameters.
//!
//! ```yaml
//! resource: tags
//! records:
//!   - { id: 1, name: alpha }
//! views:
//!   - label: first-page
//!     params: { page: 1, limit: 10 }
//! steps:
//!   - upsert: { id: 2, name: beta }
//!   - advance: 2000
//!   - remove: { id: 1 }
//! ```

use color_eyre::{eyre::eyre, Report, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{
  record_matches, CacheStore, CachedPage, MemoryStore, Partition, Record, RecordId,
};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::coordinator::{RefreshCoordinator, RefreshTrigger};
use crate::engine::SyncEngine;
use crate::event::{push_channel, MutationOutcome, PushEvent, PushReceiver, PushSender};
use crate::key::{ListParams, QueryKey};
use crate::query::{refresh_fn, Query, SharedQuery};
use crate::registry::RegistryStats;
use crate::utils::lock;

/// Poll rounds to wait for in-flight fetches after a step.
const SETTLE_ROUNDS: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
  pub resource: String,
  #[serde(default)]
  pub records: Vec<Value>,
  pub views: Vec<ViewSpec>,
  #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
  pub steps: Vec<Step>,
  /// When false, refetched pages are dropped instead of written to the
  /// cache, so the report shows what push patching alone produced.
  #[serde(default = "default_true")]
  pub apply_refetches: bool,
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewSpec {
  pub label: String,
  #[serde(default)]
  pub params: ListParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
  /// Backend change announced through a push event
  Upsert(Value),
  Remove { id: Value },
  /// Local mutation: the backend changes and the registry is triggered
  Mutation(MutationStep),
  /// Move the clock forward, in milliseconds
  Advance(u64),
  /// Every view observes a cache invalidation
  Invalidate,
  /// Every view's query refetches directly
  Refetch,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStep {
  Upsert(Value),
  Remove { id: Value },
}

impl Scenario {
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read scenario {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse scenario {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let scenario: Scenario = serde_yaml::from_str(contents)?;
    if scenario.resource.is_empty() {
      return Err(eyre!("scenario has no resource"));
    }
    if scenario.views.is_empty() {
      return Err(eyre!("scenario mounts no views"));
    }
    Ok(scenario)
  }
}

fn record_id_of(value: &Value) -> Result<RecordId> {
  RecordId::from_value(value).ok_or_else(|| eyre!("invalid record id: {}", value))
}

/// Reference backend: lists records newest first.
#[derive(Debug, Default)]
pub struct Backend {
  records: HashMap<RecordId, (u64, Value)>,
  next_seq: u64,
}

impl Backend {
  pub fn seeded(records: &[Value]) -> Result<Self> {
    let mut backend = Self::default();
    for record in records {
      backend.upsert(record.clone())?;
    }
    Ok(backend)
  }

  /// Insert or replace a record. Returns the partition the record was in
  /// before, if it existed.
  pub fn upsert(&mut self, record: Value) -> Result<Option<Partition>> {
    let id = record
      .get("id")
      .and_then(RecordId::from_value)
      .ok_or_else(|| eyre!("record without id: {}", record))?;
    if let Some((_, existing)) = self.records.get_mut(&id) {
      let previous = existing.partition();
      *existing = record;
      return Ok(Some(previous));
    }
    self.next_seq += 1;
    self.records.insert(id, (self.next_seq, record));
    Ok(None)
  }

  pub fn remove(&mut self, id: &RecordId) -> Option<Value> {
    self.records.remove(id).map(|(_, record)| record)
  }

  /// Every record matching `params`, newest first.
  pub fn listing(&self, params: &ListParams) -> Vec<Value> {
    let mut rows: Vec<_> = self
      .records
      .values()
      .filter(|(_, record)| record_matches(params, record))
      .collect();
    rows.sort_by(|a, b| b.0.cmp(&a.0));
    rows.into_iter().map(|(_, record)| record.clone()).collect()
  }

  pub fn page(&self, params: &ListParams) -> CachedPage<Value> {
    let listing = self.listing(params);
    let total = listing.len() as u64;
    let rows = listing
      .into_iter()
      .skip(params.offset() as usize)
      .take(params.limit as usize)
      .collect();
    CachedPage::new(rows, params.page, params.limit, total)
  }

  /// Ways in which `page` disagrees with this backend for `params`.
  ///
  /// Pages beyond the first are not shifted by patches, so their rows may
  /// lag behind page boundaries and their totals are not compared. Every
  /// cached row must still be listed with current data in backend order.
  pub fn drift(&self, params: &ListParams, page: &CachedPage<Value>) -> Vec<String> {
    let mut drift = Vec::new();
    if params.is_first_page() {
      let expected = self.page(params);
      if page.total != expected.total {
        drift.push(format!("total is {}, backend has {}", page.total, expected.total));
      }
      if page.total_pages != expected.total_pages {
        drift.push(format!(
          "totalPages is {}, backend has {}",
          page.total_pages, expected.total_pages
        ));
      }
    }
    if page.rows.len() as u64 > params.limit {
      drift.push(format!("{} rows exceed limit {}", page.rows.len(), params.limit));
    }

    let listing = self.listing(params);
    let mut last_position = None;
    for row in &page.rows {
      let id = row.record_id();
      match listing.iter().position(|r| r.record_id() == id) {
        None => drift.push(format!("row {} is no longer listed", id)),
        Some(position) => {
          if &listing[position] != row {
            drift.push(format!("row {} holds stale data", id));
          }
          if last_position.is_some_and(|last| position < last) {
            drift.push(format!("row {} is out of order", id));
          }
          last_position = Some(position);
        }
      }
    }
    drift
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewReport {
  pub label: String,
  pub key: String,
  pub rows: Vec<RecordId>,
  pub total: u64,
  pub total_pages: u64,
  pub cache_version: u64,
  pub refresh_count: u64,
  pub fetch_count: u64,
  pub consistent: bool,
  pub drift: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
  pub resource: String,
  pub steps: usize,
  pub views: Vec<ViewReport>,
  pub registry: RegistryStats,
}

impl ReplayReport {
  pub fn is_consistent(&self) -> bool {
    self.views.iter().all(|v| v.consistent)
  }

  pub fn drifted(&self) -> impl Iterator<Item = &ViewReport> {
    self.views.iter().filter(|v| !v.consistent)
  }

  pub fn to_json(&self) -> Result<String> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  pub fn render_text(&self) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "resource {} after {} steps", self.resource, self.steps);
    for view in &self.views {
      let rows: Vec<&str> = view.rows.iter().map(RecordId::as_str).collect();
      let _ = writeln!(
        out,
        "  {:<16} total={} pages={} version={} refreshes={} fetches={} {}",
        view.label,
        view.total,
        view.total_pages,
        view.cache_version,
        view.refresh_count,
        view.fetch_count,
        if view.consistent { "ok" } else { "DRIFT" }
      );
      let _ = writeln!(out, "    rows [{}]", rows.join(", "));
      for drift in &view.drift {
        let _ = writeln!(out, "    - {}", drift);
      }
    }
    let _ = writeln!(
      out,
      "registry triggers={} debounced={} fallbacks={} callbacks={} failed={}",
      self.registry.triggers,
      self.registry.debounced,
      self.registry.fallbacks,
      self.registry.callbacks_run,
      self.registry.callbacks_failed
    );
    out
  }
}

struct MountedView {
  label: String,
  params: ListParams,
  key: QueryKey,
  coordinator: RefreshCoordinator,
  query: SharedQuery<CachedPage<Value>>,
}

/// A running scenario.
pub struct Replay {
  resource: String,
  apply_refetches: bool,
  clock: Arc<ManualClock>,
  engine: SyncEngine<Value, MemoryStore<Value>>,
  backend: Arc<Mutex<Backend>>,
  views: Vec<MountedView>,
  push_tx: PushSender<Value>,
  push_rx: PushReceiver<Value>,
  steps: usize,
}

impl Replay {
  /// Seed the backend, mount every view and wait for their first pages.
  pub async fn start(scenario: &Scenario, config: &Config) -> Result<Self> {
    let clock = Arc::new(ManualClock::new());
    let engine: SyncEngine<Value, MemoryStore<Value>> =
      SyncEngine::with_clock(Arc::new(MemoryStore::new()), config, clock.clone());
    let backend = Arc::new(Mutex::new(Backend::seeded(&scenario.records)?));
    let (push_tx, push_rx) = push_channel::<Value>();

    let mut views = Vec::with_capacity(scenario.views.len());
    for spec in &scenario.views {
      let key = QueryKey::list(&scenario.resource, &spec.params);
      let coordinator = engine.mount(key.clone(), spec.label.clone());
      let params = spec.params.clone();
      let source = Arc::clone(&backend);
      let query = Query::new(key.clone(), move || {
        let page = lock(&source).page(&params);
        async move { Ok::<_, Report>(page) }
      })
      .with_clock(clock.clone())
      .shared();
      lock(&query).fetch();
      views.push(MountedView {
        label: spec.label.clone(),
        params: spec.params.clone(),
        key,
        coordinator,
        query,
      });
    }

    let replay = Self {
      resource: scenario.resource.clone(),
      apply_refetches: scenario.apply_refetches,
      clock,
      engine,
      backend,
      views,
      push_tx,
      push_rx,
      steps: 0,
    };
    replay.settle(true).await?;
    for view in &replay.views {
      view.coordinator.on_ready(refresh_fn(&view.query));
    }
    info!(resource = %replay.resource, views = replay.views.len(), "scenario mounted");
    Ok(replay)
  }

  pub async fn step(&mut self, step: &Step) -> Result<()> {
    debug!(?step, "replaying step");
    match step {
      Step::Upsert(record) => {
        let previous = lock(&self.backend).upsert(record.clone())?;
        let event = match previous {
          Some(partition) if partition != record.partition() => {
            PushEvent::moved(record.clone(), partition)
          }
          _ => PushEvent::upsert(record.clone()),
        };
        self.push_tx.send(&self.resource, event)?;
      }
      Step::Remove { id } => {
        let id = record_id_of(id)?;
        match lock(&self.backend).remove(&id) {
          Some(record) => {
            let event = PushEvent::remove(id, record.partition());
            self.push_tx.send(&self.resource, event)?;
          }
          None => warn!(%id, "remove of unknown record"),
        }
      }
      Step::Mutation(mutation) => {
        let id = match mutation {
          MutationStep::Upsert(record) => {
            lock(&self.backend).upsert(record.clone())?;
            record.record_id()
          }
          MutationStep::Remove { id } => {
            let id = record_id_of(id)?;
            lock(&self.backend).remove(&id);
            id
          }
        };
        let outcome = MutationOutcome::for_resource(&self.resource).with_affected(id);
        self.engine.notify_mutation(&outcome);
      }
      Step::Advance(ms) => self.clock.advance_ms(*ms),
      Step::Invalidate => {
        for view in &self.views {
          view.coordinator.soft_refresh(RefreshTrigger::Invalidation);
        }
      }
      Step::Refetch => {
        for view in &self.views {
          lock(&view.query).refetch();
        }
      }
    }
    self.drain_push();
    self.steps += 1;
    self.settle(self.apply_refetches).await
  }

  fn drain_push(&mut self) {
    let coordinators: Vec<&RefreshCoordinator> =
      self.views.iter().map(|view| &view.coordinator).collect();
    while let Some(envelope) = self.push_rx.try_next() {
      let report = self
        .engine
        .dispatch_push(&envelope.resource, &envelope.event, &coordinators);
      debug!(id = %envelope.event.record_id(), changed = report.changed_keys.len(), "push applied");
    }
  }

  /// Wait until no query has a fetch in flight. Landed pages are written to
  /// the cache when `apply` is set.
  async fn settle(&self, apply: bool) -> Result<()> {
    for _ in 0..SETTLE_ROUNDS {
      let mut in_flight = false;
      for view in &self.views {
        let mut query = lock(&view.query);
        if query.poll() && apply && query.is_success() {
          if let Some(page) = query.data() {
            self.engine.store().set_entry(&view.key, page.clone());
          }
        }
        in_flight |= query.is_fetching();
      }
      if !in_flight {
        return Ok(());
      }
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Err(eyre!("queries did not settle"))
  }

  pub fn report(&self) -> ReplayReport {
    let backend = lock(&self.backend);
    let views = self
      .views
      .iter()
      .map(|view| {
        let cached = self.engine.store().get_entry(&view.key);
        let query = lock(&view.query);
        let mut drift = match &cached {
          Some(page) => backend.drift(&view.params, page),
          None => vec!["page is not cached".to_string()],
        };
        if let Some(error) = query.error() {
          drift.push(format!("last fetch failed: {}", error));
        }
        let page = cached
          .unwrap_or_else(|| CachedPage::new(Vec::new(), view.params.page, view.params.limit, 0));
        ViewReport {
          label: view.label.clone(),
          key: view.key.description(),
          rows: page.row_ids(),
          total: page.total,
          total_pages: page.total_pages,
          cache_version: view.coordinator.cache_version(),
          refresh_count: view.coordinator.refresh_count(),
          fetch_count: query.fetch_count(),
          consistent: drift.is_empty(),
          drift,
        }
      })
      .collect();
    ReplayReport {
      resource: self.resource.clone(),
      steps: self.steps,
      views,
      registry: self.engine.registry().stats(),
    }
  }

  pub fn shutdown(self) {
    self.engine.shutdown();
  }
}

/// Replay every step of `scenario` and report the final state.
pub async fn run(scenario: &Scenario, config: &Config) -> Result<ReplayReport> {
  let mut replay = Replay::start(scenario, config).await?;
  for step in &scenario.steps {
    replay.step(step).await?;
  }
  let report = replay.report();
  replay.shutdown();
  Ok(report)
}
