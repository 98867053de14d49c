//! Async loader for one view's data.
//!
//! A `Query<T>` owns the fetch logic for a single query key and tracks its
//! loading state. It is the usual target of a view's refresh callback:
//! [`refresh_fn`] turns a shared query into a [`RefreshFn`] that refetches it.
//!
//! # Example
//!
//! ```ignore
//! let backend = backend.clone();
//! let query = Query::new(key.clone(), move || {
//!     let backend = backend.clone();
//!     async move { backend.list(&params).await }
//! })
//! .shared();
//!
//! coordinator.on_ready(refresh_fn(&query));
//!
//! // In event loop tick
//! if lock(&query).poll() {
//!     // State changed, write the page to the cache and re-render
//! }
//! ```

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::key::QueryKey;
use crate::registry::RefreshFn;
use crate::utils::lock;

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// First fetch in flight, nothing to show yet
  Loading,
  /// Refetch in flight; the previous data stays visible
  Refreshing(T),
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  /// True while any fetch is in flight, including a background refetch.
  pub fn is_fetching(&self) -> bool {
    matches!(self, QueryState::Loading | QueryState::Refreshing(_))
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) | QueryState::Refreshing(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// A query shared between the render loop and its refresh callback.
pub type SharedQuery<T> = Arc<Mutex<Query<T>>>;

/// Async query for one key.
pub struct Query<T> {
  key: QueryKey,
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T>>>,
  clock: Arc<dyn Clock>,
  fetched_at: Option<Instant>,
  stale_time: Duration,
  fetch_count: u64,
}

impl<T: Send + 'static> Query<T> {
  /// Create a query for `key`. The fetcher is called each time `fetch()` or
  /// `refetch()` starts a request.
  pub fn new<F, Fut>(key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Self {
      key,
      state: QueryState::Idle,
      fetcher: Box::new(move || fetcher().boxed()),
      receiver: None,
      clock: Arc::new(SystemClock),
      fetched_at: None,
      stale_time: Duration::from_secs(60),
      fetch_count: 0,
    }
  }

  /// Data older than this is stale.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn shared(self) -> SharedQuery<T> {
    Arc::new(Mutex::new(self))
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_fetching(&self) -> bool {
    self.state.is_fetching()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Number of requests started so far.
  pub fn fetch_count(&self) -> u64 {
    self.fetch_count
  }

  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| self.clock.now().duration_since(t) >= self.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching unless a request is already in flight.
  pub fn fetch(&mut self) {
    if self.state.is_fetching() {
      return;
    }
    self.start_fetch();
  }

  /// Start a new request, abandoning any one in flight. Existing data stays
  /// visible until the new result arrives.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };

    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.state = QueryState::Success(data);
        self.fetched_at = Some(self.clock.now());
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        debug!(key = %self.key, %error, "query failed");
        self.state = QueryState::Error(error.to_string());
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = QueryState::Error("Query was cancelled".to_string());
        self.receiver = None;
        true
      }
    }
  }

  fn start_fetch(&mut self) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!(key = %self.key, "no async runtime to run query");
      self.state = QueryState::Error("No async runtime".to_string());
      return;
    };

    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.fetch_count += 1;
    self.state = match std::mem::replace(&mut self.state, QueryState::Idle) {
      QueryState::Success(data) | QueryState::Refreshing(data) => QueryState::Refreshing(data),
      _ => QueryState::Loading,
    };

    let future = (self.fetcher)();
    runtime.spawn(async move {
      // receiver may have been dropped by a refetch
      let _ = tx.send(future.await);
    });
  }
}

/// Refresh callback that refetches `query`. Fails once the query is gone or
/// when the refetch could not start.
pub fn refresh_fn<T: Send + 'static>(query: &SharedQuery<T>) -> RefreshFn {
  let weak = Arc::downgrade(query);
  Arc::new(move || -> Result<()> {
    let shared = weak.upgrade().ok_or_else(|| eyre!("query was dropped"))?;
    let mut query = lock(&shared);
    query.refetch();
    if let Some(error) = query.error() {
      return Err(eyre!("refetch of {} failed: {}", query.key(), error));
    }
    Ok(())
  })
}

impl<T: fmt::Debug> fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("stale_time", &self.stale_time)
      .field("fetch_count", &self.fetch_count)
      .finish_non_exhaustive()
  }
}
