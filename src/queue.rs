//! Persisted FIFO of writes that have not reached the remote store yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::storage::{LocalStorage, QUEUE_NAMESPACE};

/// Default retry budget for a queued mutation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Kind of deferred write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Upsert,
  Delete,
}

/// A pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationItem {
  /// Local identifier; doubles as the temporary document id of a creation
  pub id: String,
  pub operation: Operation,
  pub resource_type: String,
  /// Data to write, absent for deletes
  pub payload: Option<Value>,
  /// Remote document id, absent when the upsert creates a new document
  pub target_id: Option<String>,
  /// Cache category used when reconciling the confirmed value
  pub category: String,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
}

impl MutationItem {
  /// Build an item with a fresh local id and an untouched retry budget.
  pub fn new(
    operation: Operation,
    resource_type: &str,
    payload: Option<Value>,
    target_id: Option<String>,
    category: &str,
    enqueued_at: DateTime<Utc>,
    max_retries: u32,
  ) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      operation,
      resource_type: resource_type.to_string(),
      payload,
      target_id,
      category: category.to_string(),
      enqueued_at,
      retry_count: 0,
      max_retries,
    }
  }

  /// An upsert without a target id creates a new remote document.
  pub fn is_creation(&self) -> bool {
    self.operation == Operation::Upsert && self.target_id.is_none()
  }

  /// Id of the document this item writes, temporary for creations.
  pub fn document_id(&self) -> &str {
    self.target_id.as_deref().unwrap_or(&self.id)
  }
}

/// Write-through persisted mutation queue.
///
/// Every mutating call rewrites the queue blob in local storage before
/// returning, so a restart never silently loses a pending item.
pub struct MutationQueue {
  items: Mutex<VecDeque<MutationItem>>,
  storage: Arc<dyn LocalStorage>,
  clock: Arc<dyn Clock>,
  max_retries: u32,
}

impl MutationQueue {
  /// Create an empty queue.
  pub fn new(storage: Arc<dyn LocalStorage>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
    Self {
      items: Mutex::new(VecDeque::new()),
      storage,
      clock,
      max_retries,
    }
  }

  /// Rebuild the queue from local storage.
  ///
  /// Restored items keep their own retry budget. An unreadable blob is
  /// logged and treated as an empty queue.
  pub fn restore(storage: Arc<dyn LocalStorage>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
    let queue = Self::new(storage, clock, max_retries);

    let restored: VecDeque<MutationItem> = match queue.storage.read(QUEUE_NAMESPACE) {
      Ok(Some(blob)) => match serde_json::from_slice(&blob) {
        Ok(items) => items,
        Err(e) => {
          warn!(error = %e, "Discarding unreadable mutation queue");
          VecDeque::new()
        }
      },
      Ok(None) => VecDeque::new(),
      Err(e) => {
        warn!(error = %e, "Failed to read mutation queue");
        VecDeque::new()
      }
    };

    if !restored.is_empty() {
      info!(pending = restored.len(), "Mutation queue has items from previous run");
    }
    *queue.lock() = restored;
    queue
  }

  /// Append a mutation to the tail and persist.
  pub fn enqueue(
    &self,
    operation: Operation,
    resource_type: &str,
    payload: Option<Value>,
    target_id: Option<String>,
    category: &str,
  ) -> MutationItem {
    let item = MutationItem::new(
      operation,
      resource_type,
      payload,
      target_id,
      category,
      self.clock.now(),
      self.max_retries,
    );
    self.enqueue_item(item)
  }

  /// Append an already built item, keeping its id.
  pub fn enqueue_item(&self, item: MutationItem) -> MutationItem {
    let mut items = self.lock();
    items.push_back(item.clone());
    self.persist(&items);

    debug!(
      id = %item.id,
      resource = %item.resource_type,
      pending = items.len(),
      "Mutation enqueued"
    );
    item
  }

  /// Put a failed immediate write ahead of everything queued while it was in flight.
  pub fn enqueue_front(&self, item: MutationItem) -> MutationItem {
    let mut items = self.lock();
    items.push_front(item.clone());
    self.persist(&items);

    debug!(id = %item.id, pending = items.len(), "Mutation requeued at head");
    item
  }

  /// Remove an item after a confirmed remote write.
  pub fn dequeue_succeeded(&self, item_id: &str) {
    let mut items = self.lock();
    let before = items.len();
    items.retain(|i| i.id != item_id);
    if items.len() != before {
      self.persist(&items);
    }
  }

  /// Count a failed attempt.
  ///
  /// Returns `true` if the item stays queued for the next drain, `false` if
  /// its retry budget is exhausted and it was dropped. Unknown ids return
  /// `false`.
  pub fn record_failure(&self, item_id: &str) -> bool {
    let mut items = self.lock();
    let Some(pos) = items.iter().position(|i| i.id == item_id) else {
      return false;
    };

    let item = &mut items[pos];
    item.retry_count += 1;
    let retained = item.retry_count < item.max_retries;
    if !retained {
      items.remove(pos);
    }
    self.persist(&items);
    retained
  }

  /// Snapshot of pending items in FIFO order.
  pub fn drain_order(&self) -> Vec<MutationItem> {
    self.lock().iter().cloned().collect()
  }

  /// Point queued items at `remote_id` once the creation of `temp_id` is confirmed.
  ///
  /// Returns the number of items rewritten.
  pub fn rewrite_target(&self, temp_id: &str, remote_id: &str) -> usize {
    let mut items = self.lock();
    let mut rewritten = 0;
    for item in items.iter_mut() {
      if item.target_id.as_deref() == Some(temp_id) {
        item.target_id = Some(remote_id.to_string());
        rewritten += 1;
      }
    }
    if rewritten > 0 {
      self.persist(&items);
    }
    rewritten
  }

  /// Drop every item targeting `temp_id`, after its creation was abandoned.
  ///
  /// Returns the number of items dropped.
  pub fn drop_targeting(&self, temp_id: &str) -> usize {
    let mut items = self.lock();
    let before = items.len();
    items.retain(|i| i.target_id.as_deref() != Some(temp_id));
    let dropped = before - items.len();
    if dropped > 0 {
      self.persist(&items);
    }
    dropped
  }

  pub fn contains(&self, item_id: &str) -> bool {
    self.lock().iter().any(|i| i.id == item_id)
  }

  /// Whether a queued item still writes document `id` of `resource_type`.
  pub fn has_pending_for(&self, resource_type: &str, id: &str) -> bool {
    self
      .lock()
      .iter()
      .any(|i| i.resource_type == resource_type && i.document_id() == id)
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn lock(&self) -> MutexGuard<'_, VecDeque<MutationItem>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }

  // Called with the lock held so the stored blob never lags a concurrent change.
  fn persist(&self, items: &VecDeque<MutationItem>) {
    let result = serde_json::to_vec(items)
      .map_err(Into::into)
      .and_then(|blob| self.storage.write(QUEUE_NAMESPACE, &blob));

    if let Err(e) = result {
      warn!(error = %e, pending = items.len(), "Failed to persist mutation queue");
    }
  }
}
