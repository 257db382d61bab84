//! Sync coordinator: drains the mutation queue against the remote store.
//!
//! A drain pass walks a FIFO snapshot of the queue once:
//! 1. Each item is sent to the remote store
//! 2. Confirmed items leave the queue and their value is reconciled into the cache
//! 3. Failed items stay in place for the next pass until their retry budget runs out
//! 4. A [`SyncSummary`] is published once every item has been attempted
//!
//! Only one pass runs at a time; a trigger that arrives mid-pass is dropped.
//! An immediate write from the engine holds the same slot while in flight.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{document_key, CacheStore};
use crate::clock::Clock;
use crate::error::RemoteError;
use crate::event::{SyncEvents, SyncSummary};
use crate::queue::{MutationItem, MutationQueue, Operation};
use crate::remote::RemoteStore;

/// Clears the draining flag when a pass ends, including by panic.
pub(crate) struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Timer periods for [`SyncCoordinator::run`].
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
  pub sync_interval: Duration,
  pub sweep_interval: Duration,
}

impl Default for Schedule {
  fn default() -> Self {
    Self {
      sync_interval: Duration::from_secs(30),
      sweep_interval: Duration::from_secs(300),
    }
  }
}

pub struct SyncCoordinator {
  cache: Arc<CacheStore>,
  queue: Arc<MutationQueue>,
  remote: Arc<dyn RemoteStore>,
  clock: Arc<dyn Clock>,
  events: SyncEvents,
  /// Temporary creation id -> id assigned by the remote store
  aliases: Mutex<HashMap<String, String>>,
  draining: AtomicBool,
  online: AtomicBool,
  last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl SyncCoordinator {
  pub fn new(
    cache: Arc<CacheStore>,
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    online: bool,
  ) -> Self {
    Self {
      cache,
      queue,
      remote,
      clock,
      events: SyncEvents::default(),
      aliases: Mutex::new(HashMap::new()),
      draining: AtomicBool::new(false),
      online: AtomicBool::new(online),
      last_sync: Mutex::new(None),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::Acquire)
  }

  /// Record a connectivity change. Returns true on the offline -> online edge.
  pub fn set_online(&self, online: bool) -> bool {
    let was_online = self.online.swap(online, Ordering::AcqRel);
    if was_online != online {
      info!(online, "Connectivity changed");
    }
    online && !was_online
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  pub fn last_sync(&self) -> Option<DateTime<Utc>> {
    *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<SyncSummary> {
    self.events.subscribe()
  }

  /// Map a temporary creation id to its remote id, if it has one yet.
  pub fn resolve_id(&self, id: &str) -> String {
    let aliases = self.aliases.lock().unwrap_or_else(|e| e.into_inner());
    aliases.get(id).cloned().unwrap_or_else(|| id.to_string())
  }

  /// Take the drain slot, unless a pass or an immediate write holds it.
  pub(crate) fn claim(&self) -> Option<DrainGuard<'_>> {
    if self.draining.swap(true, Ordering::AcqRel) {
      return None;
    }
    Some(DrainGuard(&self.draining))
  }

  /// Run one drain pass. Returns `None` if a pass was already running.
  pub async fn drain(&self) -> Option<SyncSummary> {
    let Some(_guard) = self.claim() else {
      debug!("Drain already in progress, ignoring trigger");
      return None;
    };

    let items = self.queue.drain_order();
    debug!(pending = items.len(), "Starting drain pass");

    let mut succeeded = 0;
    let mut failed = 0;
    // Creations still unconfirmed this pass; their followers wait for them.
    let mut unconfirmed: HashSet<&str> = HashSet::new();
    for item in &items {
      if !self.queue.contains(&item.id) {
        continue;
      }
      if item.target_id.as_deref().is_some_and(|t| unconfirmed.contains(t)) {
        debug!(id = %item.id, "Waiting for the creation it targets");
        continue;
      }

      match self.apply(item).await {
        Ok(created_id) => {
          self.confirm(item, created_id.as_deref());
          succeeded += 1;
        }
        Err(e) => {
          if item.is_creation() {
            unconfirmed.insert(item.id.as_str());
          }
          if self.queue.record_failure(&item.id) {
            debug!(id = %item.id, error = %e, "Mutation failed, will retry next pass");
          } else {
            warn!(
              id = %item.id,
              resource = %item.resource_type,
              attempts = item.retry_count + 1,
              error = %e,
              "Mutation dropped after exhausting retries"
            );
            failed += 1;
            if item.is_creation() {
              failed += self.abandon_creation(item);
            }
          }
        }
      }
    }

    let timestamp = self.clock.now();
    *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(timestamp);

    let summary = SyncSummary {
      succeeded,
      failed,
      remaining: self.queue.len(),
      timestamp,
    };
    info!(
      succeeded = summary.succeeded,
      failed = summary.failed,
      remaining = summary.remaining,
      "Drain pass complete"
    );
    self.events.emit(summary.clone());
    Some(summary)
  }

  /// A creation that never reached the store takes its followers and its
  /// optimistic cache entry with it. Returns the number of followers dropped.
  fn abandon_creation(&self, item: &MutationItem) -> usize {
    let dropped = self.queue.drop_targeting(&item.id);
    self.cache.delete(&document_key(&item.resource_type, &item.id));
    if dropped > 0 {
      warn!(temp_id = %item.id, dropped, "Dropped writes to an abandoned creation");
    }
    dropped
  }

  /// Send one mutation to the remote store.
  ///
  /// Returns the remote id when the mutation created a document.
  pub async fn apply(&self, item: &MutationItem) -> Result<Option<String>, RemoteError> {
    let target = item.target_id.as_deref().map(|id| self.resolve_id(id));
    let payload = item.payload.as_ref().unwrap_or(&Value::Null);

    match (item.operation, target) {
      (Operation::Upsert, None) => {
        let id = self.remote.create(&item.resource_type, payload).await?;
        Ok(Some(id))
      }
      (Operation::Upsert, Some(id)) => {
        self.remote.update(&item.resource_type, &id, payload).await?;
        Ok(None)
      }
      (Operation::Delete, Some(id)) => {
        self.remote.delete(&item.resource_type, &id).await?;
        Ok(None)
      }
      (Operation::Delete, None) => {
        warn!(id = %item.id, "Delete without a target id, nothing to send");
        Ok(None)
      }
    }
  }

  /// Retire a confirmed mutation.
  ///
  /// Followers of a creation are pointed at the remote id before the item
  /// leaves the queue, so the stored queue never references an id that can
  /// no longer be resolved. The confirmed value is then folded into the cache.
  pub fn confirm(&self, item: &MutationItem, created_id: Option<&str>) {
    let rewritten = match created_id {
      Some(remote_id) => {
        self
          .aliases
          .lock()
          .unwrap_or_else(|e| e.into_inner())
          .insert(item.id.clone(), remote_id.to_string());
        self.queue.rewrite_target(&item.id, remote_id)
      }
      None => 0,
    };
    self.queue.dequeue_succeeded(&item.id);
    self.reconcile(item, created_id, rewritten);
  }

  /// The confirmed payload only replaces the cached value when no later
  /// queued write targets the same document; otherwise the newer optimistic
  /// value stays visible.
  fn reconcile(&self, item: &MutationItem, created_id: Option<&str>, rewritten: usize) {
    if item.operation != Operation::Upsert {
      return;
    }
    let confirmed = item.payload.clone().unwrap_or(Value::Null);

    match created_id {
      Some(remote_id) => {
        // With later writes still queued the optimistic entry is newer than
        // the confirmed payload, and its absence means a queued delete.
        let temp_key = document_key(&item.resource_type, &item.id);
        let optimistic = self.cache.peek(&temp_key);
        if optimistic.is_some() {
          self.cache.delete(&temp_key);
        }
        let value = if rewritten > 0 {
          optimistic.map(|e| e.value)
        } else {
          Some(confirmed)
        };
        if let Some(value) = value {
          self.cache.set(
            &document_key(&item.resource_type, remote_id),
            value,
            &item.category,
          );
        }
        debug!(temp_id = %item.id, remote_id, rewritten, "Creation confirmed");
      }
      None => {
        let id = self.resolve_id(item.document_id());
        if self.queue.has_pending_for(&item.resource_type, &id) {
          return;
        }
        self.cache.set(&document_key(&item.resource_type, &id), confirmed, &item.category);
      }
    }
  }

  /// Drive periodic drains and cache sweeps until `shutdown` flips to true.
  ///
  /// Timer drains only happen while online.
  pub async fn run(self: Arc<Self>, schedule: Schedule, mut shutdown: watch::Receiver<bool>) {
    let mut sync_timer = interval_at(Instant::now() + schedule.sync_interval, schedule.sync_interval);
    sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep_timer =
      interval_at(Instant::now() + schedule.sweep_interval, schedule.sweep_interval);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(?schedule, "Sync loop started");
    loop {
      tokio::select! {
        _ = sync_timer.tick() => {
          if self.is_online() {
            self.drain().await;
          }
        }
        _ = sweep_timer.tick() => {
          self.cache.sweep();
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    info!("Sync loop stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CachePolicy;
  use crate::clock::ManualClock;
  use crate::queue::DEFAULT_MAX_RETRIES;
  use crate::storage::MemoryStorage;
  use crate::testing::ScriptedRemote;
  use serde_json::json;

  struct Fixture {
    cache: Arc<CacheStore>,
    queue: Arc<MutationQueue>,
    remote: Arc<ScriptedRemote>,
    sync: Arc<SyncCoordinator>,
    storage: Arc<MemoryStorage>,
    clock: Arc<ManualClock>,
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::default());
    let cache = Arc::new(CacheStore::new(
      CachePolicy::default(),
      storage.clone(),
      clock.clone(),
    ));
    let queue = Arc::new(MutationQueue::new(
      storage.clone(),
      clock.clone(),
      DEFAULT_MAX_RETRIES,
    ));
    let remote = Arc::new(ScriptedRemote::new());
    let sync = Arc::new(SyncCoordinator::new(
      cache.clone(),
      queue.clone(),
      remote.clone(),
      clock.clone(),
      true,
    ));
    Fixture {
      cache,
      queue,
      remote,
      sync,
      storage,
      clock,
    }
  }

  fn update(f: &Fixture, id: &str, value: Value) -> MutationItem {
    f.queue
      .enqueue(Operation::Upsert, "team", Some(value), Some(id.to_string()), "team")
  }

  #[tokio::test]
  async fn test_drain_is_fifo_and_retains_failures() {
    let f = fixture();
    update(&f, "a", json!("A"));
    let b = update(&f, "b", json!("B"));
    update(&f, "c", json!("C"));
    f.remote.fail_on("b");

    let summary = f.sync.drain().await.unwrap();

    assert_eq!(f.remote.calls(), vec!["update team/a", "update team/b", "update team/c"]);
    assert_eq!((summary.succeeded, summary.failed, summary.remaining), (2, 0, 1));
    let left = f.queue.drain_order();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, b.id);
    assert_eq!(left[0].retry_count, 1);
    assert_eq!(f.cache.get("team/a"), Some(json!("A")));
  }

  #[tokio::test]
  async fn test_exhausted_item_is_dropped_and_counted() {
    let f = fixture();
    update(&f, "x", json!(1));
    f.remote.fail_all(true);

    let first = f.sync.drain().await.unwrap();
    let second = f.sync.drain().await.unwrap();
    assert_eq!((first.failed, first.remaining), (0, 1));
    assert_eq!((second.failed, second.remaining), (0, 1));

    let third = f.sync.drain().await.unwrap();
    assert_eq!((third.failed, third.remaining), (1, 0));

    let fourth = f.sync.drain().await.unwrap();
    assert_eq!((fourth.succeeded, fourth.failed, fourth.remaining), (0, 0, 0));
    assert_eq!(f.remote.calls().len(), 3);
  }

  #[tokio::test]
  async fn test_second_drain_while_draining_is_noop() {
    let f = fixture();
    update(&f, "a", json!(1));
    update(&f, "b", json!(2));
    f.remote.set_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(f.sync.drain(), f.sync.drain());

    assert_eq!(first.is_some() as u8 + second.is_some() as u8, 1);
    assert_eq!(f.remote.calls().len(), 2);
    assert!(!f.sync.is_draining());
  }

  #[tokio::test]
  async fn test_creation_moves_to_remote_key_and_rewrites_followers() {
    let f = fixture();
    let create = f
      .queue
      .enqueue(Operation::Upsert, "quests", Some(json!({"v": 1})), None, "quests");
    let temp_key = document_key("quests", &create.id);
    f.cache.set(&temp_key, json!({"v": 2}), "quests");
    f.queue.enqueue(
      Operation::Upsert,
      "quests",
      Some(json!({"v": 2})),
      Some(create.id.clone()),
      "quests",
    );

    let summary = f.sync.drain().await.unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(f.remote.calls(), vec!["create quests", "update quests/r1"]);
    assert_eq!(f.sync.resolve_id(&create.id), "r1");
    assert_eq!(f.cache.peek(&temp_key), None);
    assert_eq!(f.cache.get("quests/r1"), Some(json!({"v": 2})));
    assert_eq!(f.remote.doc("quests", "r1"), Some(json!({"v": 2})));
  }

  #[tokio::test]
  async fn test_pending_write_keeps_optimistic_value() {
    let f = fixture();
    update(&f, "a", json!("old"));
    update(&f, "a", json!("new"));
    f.cache.set("team/a", json!("new"), "team");
    f.remote.fail_on("a");

    // Both fail, nothing reconciled.
    f.sync.drain().await;
    assert_eq!(f.cache.get("team/a"), Some(json!("new")));

    f.remote.recover("a");
    f.sync.drain().await;
    assert_eq!(f.cache.get("team/a"), Some(json!("new")));
    assert_eq!(f.remote.doc("team", "a"), Some(json!("new")));
  }

  #[tokio::test]
  async fn test_summary_is_broadcast() {
    let f = fixture();
    let mut events = f.sync.subscribe_events();
    update(&f, "a", json!(1));

    let summary = f.sync.drain().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), summary);
    assert_eq!(f.sync.last_sync(), Some(summary.timestamp));
  }

  #[test]
  fn test_online_edges() {
    let f = fixture();
    assert!(!f.sync.set_online(true));
    assert!(!f.sync.set_online(false));
    assert!(!f.sync.set_online(false));
    assert!(f.sync.set_online(true));
  }

  #[tokio::test(start_paused = true)]
  async fn test_run_loop_drains_on_tick_and_stops() {
    let f = fixture();
    update(&f, "a", json!(1));
    let (tx, rx) = watch::channel(false);
    let schedule = Schedule {
      sync_interval: Duration::from_secs(30),
      sweep_interval: Duration::from_secs(300),
    };
    let task = tokio::spawn(Arc::clone(&f.sync).run(schedule, rx));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(f.queue.is_empty());

    tx.send(true).unwrap();
    task.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_run_loop_skips_drain_while_offline() {
    let f = fixture();
    update(&f, "a", json!(1));
    f.sync.set_online(false);
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&f.sync).run(Schedule::default(), rx));

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert_eq!(f.queue.len(), 1);
    assert!(f.remote.calls().is_empty());

    tx.send(true).unwrap();
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_confirmed_creation_leaves_rewritten_followers_in_storage() {
    let f = fixture();
    let create = f
      .queue
      .enqueue(Operation::Upsert, "quests", Some(json!({"v": 1})), None, "quests");
    let follower = f.queue.enqueue(
      Operation::Delete,
      "quests",
      None,
      Some(create.id.clone()),
      "quests",
    );
    f.remote.fail_on("r1");

    f.sync.drain().await.unwrap();

    let stored = MutationQueue::restore(f.storage.clone(), f.clock.clone(), DEFAULT_MAX_RETRIES);
    let pending = stored.drain_order();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, follower.id);
    assert_eq!(pending[0].target_id.as_deref(), Some("r1"));
  }

  #[tokio::test]
  async fn test_followers_wait_for_unconfirmed_creation() {
    let f = fixture();
    let create = f
      .queue
      .enqueue(Operation::Upsert, "quests", Some(json!({"v": 1})), None, "quests");
    f.queue.enqueue(
      Operation::Upsert,
      "quests",
      Some(json!({"v": 2})),
      Some(create.id.clone()),
      "quests",
    );
    f.remote.fail_on("quests");

    let summary = f.sync.drain().await.unwrap();

    assert_eq!(f.remote.calls(), vec!["create quests"]);
    assert_eq!((summary.failed, summary.remaining), (0, 2));
    assert_eq!(f.queue.drain_order()[1].retry_count, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_run_loop_sweeps_expired_entries() {
    let f = fixture();
    f.sync.set_online(false);
    f.cache.set("chat/1", json!("old"), "chat");
    f.cache.set("profile/1", json!("kept"), "profile");
    f.clock.advance(chrono::Duration::minutes(2));
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&f.sync).run(Schedule::default(), rx));

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert!(f.cache.peek("chat/1").is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(f.cache.peek("chat/1").is_none());
    assert!(f.cache.peek("profile/1").is_some());

    tx.send(true).unwrap();
    task.await.unwrap();
  }
}
