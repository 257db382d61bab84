//! Time source and TTL arithmetic.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Returns true once more than `ttl` has elapsed since `stored_at`.
///
/// An entry is still valid at exactly `stored_at + ttl`.
pub fn is_expired(stored_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
  now - stored_at > ttl
}

/// Source of the current time, injected so TTL behaviour can be tested.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Move the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}
