//! SQLite-backed local storage.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::LocalStorage;
use crate::error::StorageError;

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Open a database that lives only as long as this value.
  pub fn in_memory() -> Result<Self, StorageError> {
    let storage = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;

    Some(data_dir.join("teamsync").join("state.db"))
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
  }
}

/// Schema for the namespace table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    namespace TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl LocalStorage for SqliteStorage {
  fn read(&self, namespace: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

    let data = conn
      .query_row(
        "SELECT data FROM kv WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .optional()?;

    Ok(data)
  }

  fn write(&self, namespace: &str, blob: &[u8]) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

    conn.execute(
      "INSERT OR REPLACE INTO kv (namespace, data, written_at)
       VALUES (?, ?, datetime('now'))",
      params![namespace, blob],
    )?;

    Ok(())
  }
}
