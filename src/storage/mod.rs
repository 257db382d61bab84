//! Local persistent key-value storage used to survive restarts.
//!
//! The engine stores two blobs, one per namespace: the mirrored cache
//! entries and the pending mutation queue. Backends only need to read and
//! overwrite whole blobs.

mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StorageError;

pub use sqlite::SqliteStorage;

/// Namespace holding mirrored cache entries.
pub const CACHE_NAMESPACE: &str = "cache-entries";
/// Namespace holding the pending mutation queue.
pub const QUEUE_NAMESPACE: &str = "mutation-queue";

/// Trait for local storage backends.
pub trait LocalStorage: Send + Sync {
  /// Read the blob stored under `namespace`, if any.
  fn read(&self, namespace: &str) -> Result<Option<Vec<u8>>, StorageError>;

  /// Replace the blob stored under `namespace`.
  fn write(&self, namespace: &str, blob: &[u8]) -> Result<(), StorageError>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl LocalStorage for NoopStorage {
  fn read(&self, _namespace: &str) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(None) // Always empty
  }

  fn write(&self, _namespace: &str, _blob: &[u8]) -> Result<(), StorageError> {
    Ok(()) // Discard
  }
}

/// In-process storage, for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStorage {
  blobs: Mutex<HashMap<String, Vec<u8>>>,
  fail_writes: Mutex<bool>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent write fail, as a full disk or quota would.
  pub fn fail_writes(&self, fail: bool) {
    if let Ok(mut flag) = self.fail_writes.lock() {
      *flag = fail;
    }
  }
}

impl LocalStorage for MemoryStorage {
  fn read(&self, namespace: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let blobs = self.blobs.lock().map_err(|_| StorageError::LockPoisoned)?;
    Ok(blobs.get(namespace).cloned())
  }

  fn write(&self, namespace: &str, blob: &[u8]) -> Result<(), StorageError> {
    let failing = *self
      .fail_writes
      .lock()
      .map_err(|_| StorageError::LockPoisoned)?;
    if failing {
      return Err(StorageError::Unavailable("storage quota exceeded".to_string()));
    }

    let mut blobs = self.blobs.lock().map_err(|_| StorageError::LockPoisoned)?;
    blobs.insert(namespace.to_string(), blob.to_vec());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_storage_overwrites() {
    let storage = MemoryStorage::new();
    assert!(storage.read(QUEUE_NAMESPACE).unwrap().is_none());

    storage.write(QUEUE_NAMESPACE, b"one").unwrap();
    storage.write(QUEUE_NAMESPACE, b"two").unwrap();
    assert_eq!(storage.read(QUEUE_NAMESPACE).unwrap(), Some(b"two".to_vec()));
    assert!(storage.read(CACHE_NAMESPACE).unwrap().is_none());
  }

  #[test]
  fn test_memory_storage_failing_writes() {
    let storage = MemoryStorage::new();
    storage.fail_writes(true);
    assert!(storage.write(CACHE_NAMESPACE, b"x").is_err());
    storage.fail_writes(false);
    assert!(storage.write(CACHE_NAMESPACE, b"x").is_ok());
  }

  #[test]
  fn test_noop_storage_is_always_empty() {
    let storage = NoopStorage;
    storage.write(CACHE_NAMESPACE, b"x").unwrap();
    assert!(storage.read(CACHE_NAMESPACE).unwrap().is_none());
  }
}
