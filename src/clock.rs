//! Time sources for debounce decisions.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::utils::lock;

/// Monotonic time source.
///
/// Injected into the registry and coordinators so that each logical clock
/// (a live session, a replay, a test) keeps its own notion of "now".
pub trait Clock: Send + Sync + fmt::Debug {
  fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  origin: Instant,
  elapsed: Mutex<Duration>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self {
      origin: Instant::now(),
      elapsed: Mutex::new(Duration::ZERO),
    }
  }

  pub fn advance(&self, by: Duration) {
    *lock(&self.elapsed) += by;
  }

  pub fn advance_ms(&self, ms: u64) {
    self.advance(Duration::from_millis(ms));
  }

  /// Time passed since the clock was created.
  pub fn elapsed(&self) -> Duration {
    *lock(&self.elapsed)
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Instant {
    self.origin + *lock(&self.elapsed)
  }
}
