use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::storage::{CacheStorage, CacheStorageError};
use super::traits::CachedResponse;
use crate::fetch::Response;

/// In-process cache storage.
///
/// Writes can be made to fail, which is how cache write errors are exercised.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
  caches: Mutex<Vec<(String, BTreeMap<String, CachedResponse>)>>,
  reject_writes: AtomicBool,
}

impl MemoryCacheStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn reject_writes(&self, reject: bool) {
    self.reject_writes.store(reject, Ordering::SeqCst);
  }

  fn lock(&self) -> MutexGuard<'_, Vec<(String, BTreeMap<String, CachedResponse>)>> {
    self.caches.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl CacheStorage for MemoryCacheStorage {
  fn keys(&self) -> Result<Vec<String>, CacheStorageError> {
    Ok(self.lock().iter().map(|(name, _)| name.clone()).collect())
  }

  fn open(&self, cache: &str) -> Result<(), CacheStorageError> {
    let mut caches = self.lock();
    if !caches.iter().any(|(name, _)| name == cache) {
      caches.push((cache.to_string(), BTreeMap::new()));
    }
    Ok(())
  }

  fn put(&self, cache: &str, url: &str, response: &Response) -> Result<(), CacheStorageError> {
    if self.reject_writes.load(Ordering::SeqCst) {
      return Err(CacheStorageError::Backend("quota exceeded".to_string()));
    }
    self.open(cache)?;

    let mut caches = self.lock();
    if let Some((_, entries)) = caches.iter_mut().find(|(name, _)| name == cache) {
      entries.insert(
        url.to_string(),
        CachedResponse {
          url: url.to_string(),
          response: response.clone(),
          stored_at: Utc::now(),
        },
      );
    }
    Ok(())
  }

  fn match_in(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>, CacheStorageError> {
    Ok(
      self
        .lock()
        .iter()
        .find(|(name, _)| name == cache)
        .and_then(|(_, entries)| entries.get(url).cloned()),
    )
  }

  fn delete(&self, cache: &str) -> Result<bool, CacheStorageError> {
    let mut caches = self.lock();
    let before = caches.len();
    caches.retain(|(name, _)| name != cache);
    Ok(caches.len() != before)
  }

  fn urls(&self, cache: &str) -> Result<Vec<String>, CacheStorageError> {
    Ok(
      self
        .lock()
        .iter()
        .find(|(name, _)| name == cache)
        .map(|(_, entries)| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}
