use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{DurableStore, StoreError};

/// In-process log, lost when the process exits.
///
/// Can be switched into a "full" state where every write fails, which is how
/// quota exhaustion is exercised in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
  records: Mutex<Vec<Vec<u8>>>,
  full: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make subsequent writes fail with [`StoreError::Full`].
  pub fn set_full(&self, full: bool) {
    self.full.store(full, Ordering::SeqCst);
  }

  /// Number of raw records currently in the log.
  #[cfg(test)]
  pub fn len(&self) -> usize {
    self
      .records
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  fn check_capacity(&self) -> Result<(), StoreError> {
    if self.full.load(Ordering::SeqCst) {
      return Err(StoreError::Full("memory store quota exceeded".to_string()));
    }
    Ok(())
  }
}

impl DurableStore for MemoryStore {
  fn append(&self, record: &[u8]) -> Result<(), StoreError> {
    self.check_capacity()?;
    self
      .records
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(record.to_vec());
    Ok(())
  }

  fn read_log(&self) -> Result<Vec<Vec<u8>>, StoreError> {
    Ok(
      self
        .records
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone(),
    )
  }

  fn rewrite_log(&self, rewrite: &mut dyn FnMut(&[Vec<u8>]) -> Vec<Vec<u8>>) -> Result<usize, StoreError> {
    self.check_capacity()?;
    let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
    let rewritten = rewrite(&records);
    *records = rewritten;
    Ok(records.len())
  }
}
