//! Keyed TTL cache for remote resources.
//!
//! This module provides the engine's read side:
//! - Caches arbitrary JSON values under `"<collection>/<id>"` keys
//! - Expires entries by category TTL, lazily on access and on a periodic sweep
//! - Mirrors allow-listed categories to local storage for restart survival
//! - Notifies subscribers whenever a key changes or is invalidated

mod policy;
mod store;
mod traits;

pub use policy::{CachePolicy, CategoryPolicy};
pub use store::{CacheEntry, CacheStore};
pub use traits::{CacheResult, CacheSource};

/// Cache key of a single document.
pub fn document_key(resource_type: &str, id: &str) -> String {
  format!("{}/{}", resource_type, id)
}

/// Cache key of a whole collection snapshot.
pub fn collection_key(resource_type: &str) -> String {
  resource_type.to_string()
}
