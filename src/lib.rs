//! Offline cache and mutation sync engine for the team dashboard.
//!
//! Feature code talks to an [`Engine`](engine::Engine): reads go through a
//! TTL cache that falls back to stale data when the document store is
//! unreachable, and writes are applied optimistically, then queued and
//! retried until the store confirms them.

pub mod cache;
pub mod clock;
pub mod engine;
pub mod error;
pub mod event;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod subscribers;
pub mod sync;

#[cfg(test)]
mod testing;

pub use engine::{Engine, EngineSettings, EngineStats, WriteReceipt};
pub use error::{RemoteError, StorageError};
