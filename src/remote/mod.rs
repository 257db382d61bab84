//! Access to the remote document store.

mod http;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteError;

pub use http::HttpRemote;

/// Typed facade over the remote document store.
///
/// Implementations own their timeout policy; a timed-out call is reported
/// as an ordinary [`RemoteError`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Create a document and return the id the store assigned to it.
  async fn create(&self, resource_type: &str, payload: &Value) -> Result<String, RemoteError>;

  async fn update(&self, resource_type: &str, id: &str, payload: &Value) -> Result<(), RemoteError>;

  async fn delete(&self, resource_type: &str, id: &str) -> Result<(), RemoteError>;

  async fn fetch_one(&self, resource_type: &str, id: &str) -> Result<Option<Value>, RemoteError>;

  async fn fetch_collection(&self, resource_type: &str) -> Result<Vec<Value>, RemoteError>;
}

/// Stand-in for a store that was never configured: every call reports
/// [`RemoteError::Offline`], so writes stay queued and reads fall back to cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectedRemote;

#[async_trait]
impl RemoteStore for DisconnectedRemote {
  async fn create(&self, _resource_type: &str, _payload: &Value) -> Result<String, RemoteError> {
    Err(RemoteError::Offline)
  }

  async fn update(&self, _resource_type: &str, _id: &str, _payload: &Value) -> Result<(), RemoteError> {
    Err(RemoteError::Offline)
  }

  async fn delete(&self, _resource_type: &str, _id: &str) -> Result<(), RemoteError> {
    Err(RemoteError::Offline)
  }

  async fn fetch_one(&self, _resource_type: &str, _id: &str) -> Result<Option<Value>, RemoteError> {
    Err(RemoteError::Offline)
  }

  async fn fetch_collection(&self, _resource_type: &str) -> Result<Vec<Value>, RemoteError> {
    Err(RemoteError::Offline)
  }
}
