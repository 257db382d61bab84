//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::RemoteError;
use crate::remote::RemoteStore;

/// In-memory remote store with scripted failures and a call log.
#[derive(Default)]
pub struct ScriptedRemote {
  docs: Mutex<HashMap<String, Value>>,
  next_id: AtomicU64,
  fail_all: AtomicBool,
  failing: Mutex<HashSet<String>>,
  calls: Mutex<Vec<String>>,
  delay: Mutex<Option<Duration>>,
}

impl ScriptedRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fail every call.
  pub fn fail_all(&self, fail: bool) {
    self.fail_all.store(fail, Ordering::SeqCst);
  }

  /// Fail calls touching document `id`, or any document of resource `id`.
  pub fn fail_on(&self, id: &str) {
    self.failing.lock().unwrap().insert(id.to_string());
  }

  pub fn recover(&self, id: &str) {
    self.failing.lock().unwrap().remove(id);
  }

  /// Make every call take `delay` before answering.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Calls made so far, as `"<op> <resource>[/<id>]"`.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn doc(&self, resource_type: &str, id: &str) -> Option<Value> {
    self
      .docs
      .lock()
      .unwrap()
      .get(&format!("{}/{}", resource_type, id))
      .cloned()
  }

  pub fn insert(&self, resource_type: &str, id: &str, value: Value) {
    self
      .docs
      .lock()
      .unwrap()
      .insert(format!("{}/{}", resource_type, id), value);
  }

  async fn enter(&self, op: &str, resource_type: &str, id: Option<&str>) -> Result<(), RemoteError> {
    let target = match id {
      Some(id) => format!("{}/{}", resource_type, id),
      None => resource_type.to_string(),
    };
    self.calls.lock().unwrap().push(format!("{} {}", op, target));

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let failing = self.fail_all.load(Ordering::SeqCst) || {
      let failing = self.failing.lock().unwrap();
      failing.contains(resource_type) || id.is_some_and(|id| failing.contains(id))
    };
    if failing {
      return Err(RemoteError::Transport(format!("scripted failure: {} {}", op, target)));
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
  async fn create(&self, resource_type: &str, payload: &Value) -> Result<String, RemoteError> {
    self.enter("create", resource_type, None).await?;
    let id = format!("r{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    self.insert(resource_type, &id, payload.clone());
    Ok(id)
  }

  async fn update(&self, resource_type: &str, id: &str, payload: &Value) -> Result<(), RemoteError> {
    self.enter("update", resource_type, Some(id)).await?;
    self.insert(resource_type, id, payload.clone());
    Ok(())
  }

  async fn delete(&self, resource_type: &str, id: &str) -> Result<(), RemoteError> {
    self.enter("delete", resource_type, Some(id)).await?;
    self
      .docs
      .lock()
      .unwrap()
      .remove(&format!("{}/{}", resource_type, id));
    Ok(())
  }

  async fn fetch_one(&self, resource_type: &str, id: &str) -> Result<Option<Value>, RemoteError> {
    self.enter("fetch", resource_type, Some(id)).await?;
    Ok(self.doc(resource_type, id))
  }

  async fn fetch_collection(&self, resource_type: &str) -> Result<Vec<Value>, RemoteError> {
    self.enter("fetch", resource_type, None).await?;
    let prefix = format!("{}/", resource_type);
    let docs = self.docs.lock().unwrap();
    let mut keys: Vec<&String> = docs.keys().filter(|k| k.starts_with(&prefix)).collect();
    keys.sort();
    Ok(keys.into_iter().map(|k| docs[k].clone()).collect())
  }
}
