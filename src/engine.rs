//! The engine facade used by feature managers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{collection_key, document_key, CachePolicy, CacheResult, CacheStore};
use crate::clock::Clock;
use crate::error::RemoteError;
use crate::event::SyncSummary;
use crate::queue::{MutationItem, MutationQueue, Operation, DEFAULT_MAX_RETRIES};
use crate::remote::RemoteStore;
use crate::storage::LocalStorage;
use crate::subscribers::Subscription;
use crate::sync::{Schedule, SyncCoordinator};

/// Construction-time settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
  pub policy: CachePolicy,
  pub max_retries: u32,
  pub schedule: Schedule,
  /// Assumed connectivity until the first `set_online` call
  pub start_online: bool,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      policy: CachePolicy::default(),
      max_retries: DEFAULT_MAX_RETRIES,
      schedule: Schedule::default(),
      start_online: true,
    }
  }
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
  pub cache_size: usize,
  pub queue_length: usize,
  pub last_sync: Option<DateTime<Utc>>,
  pub online: bool,
}

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
  /// Document id: the remote id once confirmed, otherwise the temporary id for creations
  pub id: String,
  /// The write is waiting in the mutation queue
  pub queued: bool,
}

/// Offline cache and mutation sync engine.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
  cache: Arc<CacheStore>,
  queue: Arc<MutationQueue>,
  sync: Arc<SyncCoordinator>,
  clock: Arc<dyn Clock>,
  remote: Arc<dyn RemoteStore>,
  settings: EngineSettings,
}

/// Background loop started by [`Engine::spawn`].
pub struct EngineHandle {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl EngineHandle {
  /// Stop the loop and wait for it. An in-flight drain pass finishes first.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    if let Err(e) = self.task.await {
      warn!(error = %e, "Sync loop ended abnormally");
    }
  }
}

impl Engine {
  /// Build an engine, restoring mirrored cache entries and pending mutations from `storage`.
  pub fn new(
    remote: Arc<dyn RemoteStore>,
    storage: Arc<dyn LocalStorage>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
  ) -> Self {
    let cache = Arc::new(CacheStore::restore(
      settings.policy.clone(),
      Arc::clone(&storage),
      Arc::clone(&clock),
    ));
    let queue = Arc::new(MutationQueue::restore(
      storage,
      Arc::clone(&clock),
      settings.max_retries,
    ));
    let sync = Arc::new(SyncCoordinator::new(
      Arc::clone(&cache),
      Arc::clone(&queue),
      Arc::clone(&remote),
      Arc::clone(&clock),
      settings.start_online,
    ));

    Self {
      cache,
      queue,
      sync,
      clock,
      remote,
      settings,
    }
  }

  /// Start the periodic drain and sweep loop.
  pub fn spawn(&self) -> EngineHandle {
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&self.sync).run(self.settings.schedule, rx));
    EngineHandle { shutdown: tx, task }
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    self.cache.get(key)
  }

  pub fn set(&self, key: &str, value: Value, category: &str) -> Value {
    self.cache.set(key, value, category)
  }

  pub fn has(&self, key: &str) -> bool {
    self.cache.has(key)
  }

  pub fn delete(&self, key: &str) -> bool {
    self.cache.delete(key)
  }

  pub fn clear(&self, category: Option<&str>) -> usize {
    self.cache.clear(category)
  }

  pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
  where
    F: Fn(Option<&Value>) + Send + Sync + 'static,
  {
    self.cache.subscribers().subscribe(key, callback)
  }

  /// Serve `key` from cache, or load it and cache the result.
  ///
  /// When loading fails and an entry exists, even an expired one, that value
  /// is returned marked stale. A `NotFound` answer is definitive and never
  /// falls back.
  pub async fn fetch_through<F, Fut>(
    &self,
    key: &str,
    category: &str,
    loader: F,
  ) -> Result<CacheResult<Value>, RemoteError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, RemoteError>>,
  {
    let existing = self.cache.peek(key);
    if let Some(entry) = &existing {
      if !entry.is_expired(self.clock.now()) {
        return Ok(CacheResult::from_cache(entry.value.clone(), entry.stored_at));
      }
    }

    match loader().await {
      Ok(value) => {
        self.cache.set(key, value.clone(), category);
        Ok(CacheResult::from_network(value))
      }
      Err(e) if e.is_not_found() => Err(e),
      Err(e) => match existing {
        Some(entry) => {
          warn!(key, error = %e, "Fetch failed, serving stale cache");
          Ok(CacheResult::stale(entry.value, entry.stored_at))
        }
        None => Err(e),
      },
    }
  }

  /// Fetch one document through the cache. `Ok(None)` when the store has no such document.
  pub async fn fetch_one(
    &self,
    resource_type: &str,
    id: &str,
    category: &str,
  ) -> Result<Option<CacheResult<Value>>, RemoteError> {
    let id = self.sync.resolve_id(id);
    let key = document_key(resource_type, &id);
    let remote = Arc::clone(&self.remote);
    let loader = || async move {
      remote
        .fetch_one(resource_type, &id)
        .await?
        .ok_or_else(|| RemoteError::NotFound(document_key(resource_type, &id)))
    };

    match self.fetch_through(&key, category, loader).await {
      Ok(result) => Ok(Some(result)),
      Err(e) if e.is_not_found() => {
        self.cache.delete(&key);
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  /// Fetch a whole collection through the cache, as a JSON array.
  pub async fn fetch_collection(
    &self,
    resource_type: &str,
    category: &str,
  ) -> Result<CacheResult<Value>, RemoteError> {
    let remote = Arc::clone(&self.remote);
    self
      .fetch_through(&collection_key(resource_type), category, || async move {
        Ok::<_, RemoteError>(Value::Array(remote.fetch_collection(resource_type).await?))
      })
      .await
  }

  /// Optimistically write a document.
  ///
  /// `id` of `None` creates a new document under a temporary id. The cache
  /// and subscribers see the value immediately; the remote write is tried
  /// now when possible and queued otherwise.
  pub async fn upsert(
    &self,
    resource_type: &str,
    id: Option<&str>,
    payload: Value,
    category: &str,
  ) -> WriteReceipt {
    let item = MutationItem::new(
      Operation::Upsert,
      resource_type,
      Some(payload.clone()),
      id.map(|id| self.sync.resolve_id(id)),
      category,
      self.clock.now(),
      self.settings.max_retries,
    );
    self
      .cache
      .set(&document_key(resource_type, item.document_id()), payload, category);
    self.submit(item).await
  }

  /// Optimistically delete a document.
  pub async fn remove(&self, resource_type: &str, id: &str, category: &str) -> WriteReceipt {
    let id = self.sync.resolve_id(id);
    self.cache.delete(&document_key(resource_type, &id));
    let item = MutationItem::new(
      Operation::Delete,
      resource_type,
      None,
      Some(id),
      category,
      self.clock.now(),
      self.settings.max_retries,
    );
    self.submit(item).await
  }

  /// Try the remote write right away, queueing it when that is not possible.
  ///
  /// The immediate attempt holds the drain slot and only happens with an
  /// empty queue, so writes reach the store in the order they were made.
  /// Writes arriving while it is in flight queue up behind it, and a failed
  /// attempt goes back to the head of the queue.
  async fn submit(&self, item: MutationItem) -> WriteReceipt {
    let slot = if self.sync.is_online() { self.sync.claim() } else { None };
    if let Some(_slot) = slot {
      if self.queue.is_empty() {
        match self.sync.apply(&item).await {
          Ok(created_id) => {
            self.sync.confirm(&item, created_id.as_deref());
            let id = created_id.unwrap_or_else(|| self.sync.resolve_id(item.document_id()));
            debug!(resource = %item.resource_type, id = %id, "Write confirmed");
            return WriteReceipt { id, queued: false };
          }
          Err(e) => {
            debug!(resource = %item.resource_type, error = %e, "Write failed, queueing");
            let id = item.document_id().to_string();
            self.queue.enqueue_front(item);
            return WriteReceipt { id, queued: true };
          }
        }
      }
    }

    let id = item.document_id().to_string();
    self.queue.enqueue_item(item);
    WriteReceipt { id, queued: true }
  }

  /// Run a drain pass now. `None` if one is already running.
  pub async fn force_sync(&self) -> Option<SyncSummary> {
    self.sync.drain().await
  }

  /// Report a connectivity change. Coming back online starts a drain pass.
  pub async fn set_online(&self, online: bool) -> Option<SyncSummary> {
    if self.sync.set_online(online) {
      info!("Connectivity restored, draining mutation queue");
      return self.sync.drain().await;
    }
    None
  }

  pub fn is_online(&self) -> bool {
    self.sync.is_online()
  }

  /// Remote id for a temporary creation id, or the id itself.
  pub fn resolve_id(&self, id: &str) -> String {
    self.sync.resolve_id(id)
  }

  /// Pending mutations in drain order.
  pub fn pending(&self) -> Vec<MutationItem> {
    self.queue.drain_order()
  }

  pub fn sync_events(&self) -> broadcast::Receiver<SyncSummary> {
    self.sync.subscribe_events()
  }

  pub fn stats(&self) -> EngineStats {
    EngineStats {
      cache_size: self.cache.len(),
      queue_length: self.queue.len(),
      last_sync: self.sync.last_sync(),
      online: self.sync.is_online(),
    }
  }
}
