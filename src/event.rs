//! Events emitted by the engine for external listeners.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Outcome of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
  /// Items confirmed by the remote store
  pub succeeded: usize,
  /// Items dropped after exhausting their retry budget
  pub failed: usize,
  /// Items still queued after the pass
  pub remaining: usize,
  pub timestamp: DateTime<Utc>,
}

/// Broadcast channel for `sync-complete` notifications.
#[derive(Clone)]
pub struct SyncEvents {
  tx: broadcast::Sender<SyncSummary>,
}

impl SyncEvents {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Publish a summary. Having no listeners is fine.
  pub fn emit(&self, summary: SyncSummary) {
    let _ = self.tx.send(summary);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncSummary> {
    self.tx.subscribe()
  }
}

impl Default for SyncEvents {
  fn default() -> Self {
    Self::new(64)
  }
}
