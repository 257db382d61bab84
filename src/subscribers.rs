//! Per-key change notification.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{error, trace};

/// Callback invoked with the key's new value, or `None` once it is gone.
pub type Callback = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
  next_id: u64,
  by_key: HashMap<String, Vec<(u64, Callback)>>,
}

/// Registry of callbacks keyed by cache key.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
  state: Arc<Mutex<RegistryState>>,
}

/// Handle returned by [`SubscriberRegistry::subscribe`].
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
  key: String,
  id: u64,
  registry: Weak<Mutex<RegistryState>>,
}

impl Subscription {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Remove the callback. The key disappears from the registry with its last callback.
  pub fn unsubscribe(self) {
    let Some(state) = self.registry.upgrade() else {
      return;
    };
    let mut state = lock(&state);
    if let Some(callbacks) = state.by_key.get_mut(&self.key) {
      callbacks.retain(|(id, _)| *id != self.id);
      if callbacks.is_empty() {
        state.by_key.remove(&self.key);
      }
    }
  }
}

impl SubscriberRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
  where
    F: Fn(Option<&Value>) + Send + Sync + 'static,
  {
    let mut state = lock(&self.state);
    let id = state.next_id;
    state.next_id += 1;
    state
      .by_key
      .entry(key.to_string())
      .or_default()
      .push((id, Arc::new(callback)));

    Subscription {
      key: key.to_string(),
      id,
      registry: Arc::downgrade(&self.state),
    }
  }

  /// Invoke every callback registered for `key`.
  ///
  /// Callbacks run outside the registry lock, on a snapshot taken before the
  /// first one runs, so they may subscribe, unsubscribe or write to the cache.
  /// A panicking callback is logged and skipped.
  pub fn notify(&self, key: &str, value: Option<&Value>) {
    let callbacks: Vec<Callback> = {
      let state = lock(&self.state);
      match state.by_key.get(key) {
        Some(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
        None => return,
      }
    };

    trace!(key, count = callbacks.len(), "Notifying subscribers");
    for callback in callbacks {
      if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!(key, "Subscriber callback panicked");
      }
    }
  }

  /// Number of callbacks registered for `key`.
  pub fn subscriber_count(&self, key: &str) -> usize {
    lock(&self.state).by_key.get(key).map_or(0, Vec::len)
  }

  /// Whether any callback is registered for `key`.
  pub fn has_key(&self, key: &str) -> bool {
    lock(&self.state).by_key.contains_key(key)
  }
}

// Callbacks never run under this lock, so a poisoned state is still consistent.
fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
  state.lock().unwrap_or_else(|e| e.into_inner())
}
