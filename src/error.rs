//! Error types for the engine's external collaborators.

use thiserror::Error;

/// Failure talking to the remote document store.
///
/// Every variant is treated as transient by the sync loop: there is no
/// reliable way to tell a permission problem from a network blip.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("remote store unreachable: engine is offline")]
  Offline,
  #[error("remote request timed out")]
  Timeout,
  #[error("remote store returned {status}: {message}")]
  Status { status: u16, message: String },
  #[error("remote transport error: {0}")]
  Transport(String),
  #[error("failed to decode remote response: {0}")]
  Decode(String),
  #[error("{0} not found in remote store")]
  NotFound(String),
}

impl RemoteError {
  /// The store answered definitively that the document does not exist.
  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound(_))
  }
}

/// Failure reading or writing local persistent storage.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to (de)serialize stored state: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("storage lock poisoned")]
  LockPoisoned,
  #[error("{0}")]
  Unavailable(String),
}
