//! Keeps paginated, filtered list views consistent while the data behind
//! them changes through local mutations and server push events.
//!
//! The pieces, bottom-up:
//!
//! - [`key`]: structural query keys and their prefix matching
//! - [`cache`]: cached pages and the patch engine that rewrites them
//! - [`registry`]: subscriptions from keys to view refresh callbacks
//! - [`coordinator`]: per-view arbitration between refresh sources
//! - [`engine`]: the composition root tying them together

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod engine;
pub mod event;
pub mod key;
pub mod logging;
pub mod query;
pub mod registry;
pub mod replay;
mod utils;

pub use cache::{CacheStore, CachedPage, MemoryStore, PatchReport, Partition, Record, RecordId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::{DebouncePolicy, RefreshCoordinator, RefreshOutcome, RefreshTrigger};
pub use engine::SyncEngine;
pub use event::{MutationOutcome, PushEnvelope, PushEvent};
pub use key::{matches, ListParams, QueryKey, StatusFilter};
pub use query::{Query, QueryState};
pub use registry::{RefreshFn, RefreshRegistry, Registration, RegistryPolicy, TriggerOutcome};
