//! In-memory TTL cache with a best-effort local-storage mirror.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::policy::CachePolicy;
use crate::clock::{self, Clock};
use crate::storage::{LocalStorage, CACHE_NAMESPACE};
use crate::subscribers::SubscriberRegistry;

/// A single cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub stored_at: DateTime<Utc>,
  pub ttl_millis: i64,
  pub category: String,
}

impl CacheEntry {
  pub fn ttl(&self) -> Duration {
    Duration::milliseconds(self.ttl_millis)
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    clock::is_expired(self.stored_at, self.ttl(), now)
  }
}

/// Keyed cache of remote resources.
///
/// Keys are `"<collection>/<id>"` for documents and `"<collection>"` for
/// whole collection snapshots. Entries of persisted categories are mirrored
/// to local storage after every change to them.
pub struct CacheStore {
  entries: Mutex<HashMap<String, CacheEntry>>,
  policy: CachePolicy,
  storage: Arc<dyn LocalStorage>,
  clock: Arc<dyn Clock>,
  subscribers: SubscriberRegistry,
}

impl CacheStore {
  /// Create an empty cache.
  pub fn new(policy: CachePolicy, storage: Arc<dyn LocalStorage>, clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      policy,
      storage,
      clock,
      subscribers: SubscriberRegistry::new(),
    }
  }

  /// Create a cache warmed from the local-storage mirror.
  ///
  /// Entries that expired while the process was down, or whose category is no
  /// longer persisted, are discarded. An unreadable mirror yields an empty cache.
  pub fn restore(policy: CachePolicy, storage: Arc<dyn LocalStorage>, clock: Arc<dyn Clock>) -> Self {
    let store = Self::new(policy, storage, clock);
    let now = store.clock.now();

    let restored: Vec<CacheEntry> = match store.storage.read(CACHE_NAMESPACE) {
      Ok(Some(blob)) => match serde_json::from_slice(&blob) {
        Ok(entries) => entries,
        Err(e) => {
          warn!(error = %e, "Discarding unreadable cache mirror");
          Vec::new()
        }
      },
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "Failed to read cache mirror");
        Vec::new()
      }
    };

    let mut entries = store.lock();
    for entry in restored {
      if !entry.is_expired(now) && store.policy.persists(&entry.category) {
        entries.insert(entry.key.clone(), entry);
      }
    }
    info!(entries = entries.len(), "Restored cache mirror");
    drop(entries);

    store
  }

  /// Value for `key` if present and unexpired. Expired entries are purged.
  pub fn get(&self, key: &str) -> Option<Value> {
    let now = self.clock.now();
    let mut entries = self.lock();

    match entries.get(key) {
      Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
      Some(_) => {
        self.purge(&mut entries, key);
        None
      }
      None => None,
    }
  }

  /// Entry for `key` regardless of expiry. Does not purge.
  pub fn peek(&self, key: &str) -> Option<CacheEntry> {
    self.lock().get(key).cloned()
  }

  /// Same expiry semantics as [`CacheStore::get`].
  pub fn has(&self, key: &str) -> bool {
    self.get(key).is_some()
  }

  /// Store `value` under `key` and notify subscribers of `key`.
  pub fn set(&self, key: &str, value: Value, category: &str) -> Value {
    let entry = CacheEntry {
      key: key.to_string(),
      value: value.clone(),
      stored_at: self.clock.now(),
      ttl_millis: self.policy.ttl_for(category).num_milliseconds(),
      category: category.to_string(),
    };

    {
      let mut entries = self.lock();
      let previous = entries.insert(key.to_string(), entry);
      let was_persisted = previous.is_some_and(|p| self.policy.persists(&p.category));
      if was_persisted || self.policy.persists(category) {
        self.mirror(&entries);
      }
    }

    debug!(key, category, "Cache set");
    self.subscribers.notify(key, Some(&value));
    value
  }

  /// Remove `key` and notify subscribers with an absent value.
  ///
  /// Returns whether an entry existed.
  pub fn delete(&self, key: &str) -> bool {
    let existed = {
      let mut entries = self.lock();
      self.purge(&mut entries, key)
    };

    debug!(key, existed, "Cache delete");
    self.subscribers.notify(key, None);
    existed
  }

  /// Remove every entry of `category`, or everything when `None`.
  ///
  /// Returns the number of entries removed.
  pub fn clear(&self, category: Option<&str>) -> usize {
    let removed: Vec<String> = {
      let mut entries = self.lock();
      let keys: Vec<String> = entries
        .values()
        .filter(|e| category.map_or(true, |c| e.category == c))
        .map(|e| e.key.clone())
        .collect();
      for key in &keys {
        entries.remove(key);
      }
      if category.map_or(true, |c| self.policy.persists(c)) {
        self.mirror(&entries);
      }
      keys
    };

    info!(category = category.unwrap_or("*"), removed = removed.len(), "Cache cleared");
    for key in &removed {
      self.subscribers.notify(key, None);
    }
    removed.len()
  }

  /// Purge all expired entries. Returns the purge count.
  pub fn sweep(&self) -> usize {
    let now = self.clock.now();
    let mut entries = self.lock();

    let expired: Vec<String> = entries
      .values()
      .filter(|e| e.is_expired(now))
      .map(|e| e.key.clone())
      .collect();

    let mut mirror_dirty = false;
    for key in &expired {
      if let Some(entry) = entries.remove(key) {
        mirror_dirty |= self.policy.persists(&entry.category);
      }
    }
    if mirror_dirty {
      self.mirror(&entries);
    }

    info!(purged = expired.len(), remaining = entries.len(), "Cache sweep");
    expired.len()
  }

  /// Number of entries held, including expired ones not yet purged.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn subscribers(&self) -> &SubscriberRegistry {
    &self.subscribers
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    // No user code runs under this lock.
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn purge(&self, entries: &mut HashMap<String, CacheEntry>, key: &str) -> bool {
    match entries.remove(key) {
      Some(entry) => {
        if self.policy.persists(&entry.category) {
          self.mirror(entries);
        }
        true
      }
      None => false,
    }
  }

  /// Write the persisted subset to local storage. Failures are logged only.
  fn mirror(&self, entries: &HashMap<String, CacheEntry>) {
    let persisted: Vec<&CacheEntry> = entries
      .values()
      .filter(|e| self.policy.persists(&e.category))
      .collect();

    let result = serde_json::to_vec(&persisted)
      .map_err(Into::into)
      .and_then(|blob| self.storage.write(CACHE_NAMESPACE, &blob));

    if let Err(e) = result {
      warn!(error = %e, entries = persisted.len(), "Failed to mirror cache to local storage");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::storage::MemoryStorage;
  use serde_json::json;

  fn store_with(storage: Arc<MemoryStorage>, clock: Arc<ManualClock>) -> CacheStore {
    CacheStore::new(CachePolicy::default(), storage, clock)
  }

  fn fixture() -> (CacheStore, Arc<MemoryStorage>, Arc<ManualClock>) {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::default());
    (store_with(storage.clone(), clock.clone()), storage, clock)
  }

  fn mirrored_keys(storage: &MemoryStorage) -> Vec<String> {
    let blob = storage.read(CACHE_NAMESPACE).unwrap().unwrap_or_else(|| b"[]".to_vec());
    let entries: Vec<CacheEntry> = serde_json::from_slice(&blob).unwrap();
    let mut keys: Vec<String> = entries.into_iter().map(|e| e.key).collect();
    keys.sort();
    keys
  }

  #[test]
  fn test_get_returns_unexpired_value() {
    let (cache, _, clock) = fixture();
    cache.set("profile/1", json!({"name": "Ada"}), "profile");

    clock.advance(Duration::minutes(29));
    assert_eq!(cache.get("profile/1"), Some(json!({"name": "Ada"})));
    assert!(cache.has("profile/1"));
  }

  #[test]
  fn test_expired_entry_is_absent_without_sweep() {
    let (cache, storage, clock) = fixture();
    cache.set("team/7", json!(["a", "b"]), "team");
    assert_eq!(mirrored_keys(&storage), vec!["team/7"]);

    clock.advance(Duration::minutes(10) + Duration::milliseconds(1));
    assert!(!cache.has("team/7"));
    assert_eq!(cache.get("team/7"), None);
    assert_eq!(cache.len(), 0);
    assert!(mirrored_keys(&storage).is_empty());
  }

  #[test]
  fn test_overwrite_keeps_one_entry_and_notifies_each_time() {
    let (cache, _, _) = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = cache
      .subscribers()
      .subscribe("quests/3", move |v| s.lock().unwrap().push(v.cloned()));

    cache.set("quests/3", json!(1), "quests");
    cache.set("quests/3", json!(2), "quests");

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("quests/3"), Some(json!(2)));
    assert_eq!(*seen.lock().unwrap(), vec![Some(json!(1)), Some(json!(2))]);
  }

  #[test]
  fn test_only_allow_listed_categories_are_mirrored() {
    let (cache, storage, _) = fixture();
    cache.set("chat/1", json!("hi"), "chat");
    assert!(storage.read(CACHE_NAMESPACE).unwrap().is_none());

    cache.set("profile/1", json!({}), "profile");
    cache.set("chat/2", json!("yo"), "chat");
    assert_eq!(mirrored_keys(&storage), vec!["profile/1"]);
  }

  #[test]
  fn test_delete_notifies_absent_and_unmirrors() {
    let (cache, storage, _) = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = cache
      .subscribers()
      .subscribe("profile/1", move |v| s.lock().unwrap().push(v.cloned()));

    cache.set("profile/1", json!(1), "profile");
    assert!(cache.delete("profile/1"));
    assert!(!cache.delete("profile/1"));

    assert!(mirrored_keys(&storage).is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![Some(json!(1)), None, None]);
  }

  #[test]
  fn test_clear_by_category_and_all() {
    let (cache, storage, _) = fixture();
    cache.set("team/1", json!(1), "team");
    cache.set("team/2", json!(2), "team");
    cache.set("profile/1", json!(3), "profile");
    cache.set("chat/1", json!(4), "chat");

    assert_eq!(cache.clear(Some("team")), 2);
    assert!(!cache.has("team/1"));
    assert!(cache.has("chat/1"));
    assert_eq!(mirrored_keys(&storage), vec!["profile/1"]);

    assert_eq!(cache.clear(None), 2);
    assert!(cache.is_empty());
    assert!(mirrored_keys(&storage).is_empty());
  }

  #[test]
  fn test_clear_notifies_removed_keys_with_absent_value() {
    let (cache, _, _) = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut subs = Vec::new();
    for key in ["team/1", "chat/1"] {
      let s = Arc::clone(&seen);
      subs.push(
        cache
          .subscribers()
          .subscribe(key, move |v| s.lock().unwrap().push((key, v.cloned()))),
      );
    }
    cache.set("team/1", json!(1), "team");
    cache.set("chat/1", json!(2), "chat");
    seen.lock().unwrap().clear();

    cache.clear(Some("team"));
    assert_eq!(*seen.lock().unwrap(), vec![("team/1", None)]);

    cache.clear(None);
    assert_eq!(*seen.lock().unwrap(), vec![("team/1", None), ("chat/1", None)]);
  }

  #[test]
  fn test_sweep_purges_only_expired() {
    let (cache, _, clock) = fixture();
    cache.set("chat/1", json!(1), "chat");
    cache.set("profile/1", json!(2), "profile");

    clock.advance(Duration::minutes(2));
    assert_eq!(cache.sweep(), 1);
    assert_eq!(cache.len(), 1);
    assert!(cache.has("profile/1"));
  }

  #[test]
  fn test_peek_returns_expired_entry() {
    let (cache, _, clock) = fixture();
    cache.set("chat/1", json!("old"), "chat");
    clock.advance(Duration::hours(1));

    let entry = cache.peek("chat/1").unwrap();
    assert!(entry.is_expired(clock.now()));
    assert_eq!(entry.value, json!("old"));
  }

  #[test]
  fn test_restore_skips_expired_entries() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::default());

    let cache = store_with(storage.clone(), clock.clone());
    cache.set("profile/1", json!("keep"), "profile");
    clock.advance(Duration::minutes(6));
    cache.set("gamification/1", json!("fresh"), "gamification");
    clock.advance(Duration::minutes(25));
    cache.set("team/1", json!("new"), "team");
    drop(cache);

    let restored = CacheStore::restore(CachePolicy::default(), storage, clock);
    assert_eq!(restored.len(), 1);
    assert_eq!(restored.get("team/1"), Some(json!("new")));
  }

  #[test]
  fn test_mirror_failure_does_not_affect_memory() {
    let (cache, storage, _) = fixture();
    storage.fail_writes(true);

    cache.set("profile/1", json!("v"), "profile");
    assert_eq!(cache.get("profile/1"), Some(json!("v")));
  }

  #[test]
  fn test_unknown_category_gets_default_ttl() {
    let (cache, _, clock) = fixture();
    cache.set("badges/1", json!(true), "badges");
    assert_eq!(cache.peek("badges/1").unwrap().ttl(), Duration::minutes(5));

    clock.advance(Duration::minutes(6));
    assert!(!cache.has("badges/1"));
  }
}
