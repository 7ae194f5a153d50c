use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

use super::{DurableStore, StoreError};
use crate::db;

/// SQLite-backed queue log.
///
/// Several logical queues can share one database; each store only sees the
/// rows of its own namespace.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  namespace: String,
}

impl SqliteStore {
  /// Open the store in the database file at `path`.
  pub fn open(path: &Path, namespace: &str) -> Result<Self, StoreError> {
    let conn = db::open(path).map_err(|e| {
      StoreError::Unavailable(format!("failed to open {}: {}", path.display(), e))
    })?;
    Ok(Self::with_connection(conn, namespace))
  }

  /// Open a store backed by a private in-memory database.
  #[cfg(test)]
  pub fn in_memory(namespace: &str) -> Result<Self, StoreError> {
    let conn = db::open_in_memory().map_err(map_sqlite_error)?;
    Ok(Self::with_connection(conn, namespace))
  }

  fn with_connection(conn: Connection, namespace: &str) -> Self {
    Self {
      conn: Mutex::new(conn),
      namespace: namespace.to_string(),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

impl DurableStore for SqliteStore {
  fn append(&self, record: &[u8]) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO queue_log (namespace, payload) VALUES (?, ?)",
        params![self.namespace, record],
      )
      .map_err(map_sqlite_error)?;
    Ok(())
  }

  fn read_log(&self) -> Result<Vec<Vec<u8>>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT payload FROM queue_log WHERE namespace = ? ORDER BY seq")
      .map_err(map_sqlite_error)?;

    let records = stmt
      .query_map(params![self.namespace], |row| row.get::<_, Vec<u8>>(0))
      .map_err(map_sqlite_error)?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(map_sqlite_error)?;

    Ok(records)
  }

  fn rewrite_log(&self, rewrite: &mut dyn FnMut(&[Vec<u8>]) -> Vec<Vec<u8>>) -> Result<usize, StoreError> {
    let mut conn = self.lock()?;
    // Take the write lock before reading so no other connection can append
    // between the read and the delete.
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(map_sqlite_error)?;

    let current = {
      let mut stmt = tx
        .prepare("SELECT payload FROM queue_log WHERE namespace = ? ORDER BY seq")
        .map_err(map_sqlite_error)?;
      let rows = stmt
        .query_map(params![self.namespace], |row| row.get::<_, Vec<u8>>(0))
        .map_err(map_sqlite_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_sqlite_error)?;
      rows
    };
    let records = rewrite(&current);

    tx.execute(
      "DELETE FROM queue_log WHERE namespace = ?",
      params![self.namespace],
    )
    .map_err(map_sqlite_error)?;

    for record in &records {
      tx.execute(
        "INSERT INTO queue_log (namespace, payload) VALUES (?, ?)",
        params![self.namespace, record],
      )
      .map_err(map_sqlite_error)?;
    }

    tx.commit().map_err(map_sqlite_error)?;
    Ok(records.len())
  }
}

fn map_sqlite_error(e: rusqlite::Error) -> StoreError {
  match e.sqlite_error_code() {
    Some(ErrorCode::DiskFull) => StoreError::Full(e.to_string()),
    _ => StoreError::Unavailable(e.to_string()),
  }
}
