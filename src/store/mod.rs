//! Durable storage for the submission queue.
//!
//! The queue never overwrites a single serialized blob. Instead every change
//! is appended to an ordered log, and the log is periodically rewritten
//! (compacted) to the records that are still live. Backends only need to
//! offer append, full read and an atomic read-and-rewrite.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

/// Errors raised by a durable store backend.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The backend has no room left for the write.
  #[error("storage is full: {0}")]
  Full(String),
  /// The backend could not be reached or refused the operation.
  #[error("storage unavailable: {0}")]
  Unavailable(String),
}

/// An append-only log of opaque records.
pub trait DurableStore: Send + Sync {
  /// Append one record to the end of the log.
  fn append(&self, record: &[u8]) -> Result<(), StoreError>;

  /// Read every record in append order.
  fn read_log(&self) -> Result<Vec<Vec<u8>>, StoreError>;

  /// Replace the log with `rewrite(current)`, returning the new length.
  ///
  /// The read and the write happen under one lock, so a record appended by
  /// another handle on the same backend is either seen by `rewrite` or lands
  /// after the new log. It is never dropped.
  fn rewrite_log(&self, rewrite: &mut dyn FnMut(&[Vec<u8>]) -> Vec<Vec<u8>>) -> Result<usize, StoreError>;
}

impl<T: DurableStore + ?Sized> DurableStore for Box<T> {
  fn append(&self, record: &[u8]) -> Result<(), StoreError> {
    (**self).append(record)
  }

  fn read_log(&self) -> Result<Vec<Vec<u8>>, StoreError> {
    (**self).read_log()
  }

  fn rewrite_log(&self, rewrite: &mut dyn FnMut(&[Vec<u8>]) -> Vec<Vec<u8>>) -> Result<usize, StoreError> {
    (**self).rewrite_log(rewrite)
  }
}
