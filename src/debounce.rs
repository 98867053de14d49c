//! Debounce gates.
//!
//! A gate is a tiny state machine: `Idle → Suppressed(until) → Idle`. A
//! request passing an idle gate moves it to `Suppressed` for a window; any
//! request arriving before `until` is dropped without extending the window.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Debounce {
  #[default]
  Idle,
  Suppressed {
    until: Instant,
  },
}

impl Debounce {
  /// Return to `Idle` once the suppression window has elapsed.
  pub fn settle(&mut self, now: Instant) {
    if let Debounce::Suppressed { until } = *self {
      if now >= until {
        *self = Debounce::Idle;
      }
    }
  }

  pub fn is_suppressed(&self, now: Instant) -> bool {
    matches!(*self, Debounce::Suppressed { until } if now < until)
  }

  pub fn is_idle(&self) -> bool {
    matches!(self, Debounce::Idle)
  }

  /// Suppress until at least `now + window`. An existing longer window is kept.
  pub fn suppress(&mut self, now: Instant, window: Duration) {
    let until = now + window;
    *self = match *self {
      Debounce::Suppressed { until: current } if current > until => {
        Debounce::Suppressed { until: current }
      }
      _ => Debounce::Suppressed { until },
    };
    self.settle(now);
  }

  /// Let a request through if the gate is idle, then suppress for `window`.
  /// Returns false for a request that falls inside an active window.
  pub fn try_pass(&mut self, now: Instant, window: Duration) -> bool {
    self.settle(now);
    if self.is_suppressed(now) {
      return false;
    }
    self.suppress(now, window);
    true
  }
}
