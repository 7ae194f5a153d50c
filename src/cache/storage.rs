//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use super::traits::CachedResponse;
use crate::db;
use crate::fetch::Response;

#[derive(Debug, Error)]
pub enum CacheStorageError {
  #[error("cache backend error: {0}")]
  Backend(String),
  #[error("cache record could not be encoded: {0}")]
  Encode(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CacheStorageError {
  fn from(e: rusqlite::Error) -> Self {
    CacheStorageError::Backend(e.to_string())
  }
}

/// Trait for named, versioned response caches.
pub trait CacheStorage: Send + Sync {
  /// Names of every existing cache.
  fn keys(&self) -> Result<Vec<String>, CacheStorageError>;

  /// Create the named cache if it does not exist yet.
  fn open(&self, cache: &str) -> Result<(), CacheStorageError>;

  /// Store (or replace) the response for `url` in `cache`.
  fn put(&self, cache: &str, url: &str, response: &Response) -> Result<(), CacheStorageError>;

  /// Look `url` up in one cache.
  fn match_in(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>, CacheStorageError>;

  /// Look `url` up in each of `caches`, in order.
  fn match_any(
    &self,
    caches: &[String],
    url: &str,
  ) -> Result<Option<CachedResponse>, CacheStorageError> {
    for cache in caches {
      if let Some(hit) = self.match_in(cache, url)? {
        return Ok(Some(hit));
      }
    }
    Ok(None)
  }

  /// Delete a cache and all of its entries. Returns whether it existed.
  fn delete(&self, cache: &str) -> Result<bool, CacheStorageError>;

  /// URLs stored in a cache.
  fn urls(&self, cache: &str) -> Result<Vec<String>, CacheStorageError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  pub fn open(path: &Path) -> Result<Self, CacheStorageError> {
    let conn = db::open(path)
      .map_err(|e| CacheStorageError::Backend(format!("failed to open {}: {}", path.display(), e)))?;
    Self::with_connection(conn)
  }

  pub fn in_memory() -> Result<Self, CacheStorageError> {
    Self::with_connection(db::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, CacheStorageError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheStorageError> {
    self
      .conn
      .lock()
      .map_err(|e| CacheStorageError::Backend(format!("lock poisoned: {}", e)))
  }
}

impl CacheStorage for SqliteCacheStorage {
  fn keys(&self) -> Result<Vec<String>, CacheStorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_names ORDER BY created_at, name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn open(&self, cache: &str) -> Result<(), CacheStorageError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
      params![cache],
    )?;
    Ok(())
  }

  fn put(&self, cache: &str, url: &str, response: &Response) -> Result<(), CacheStorageError> {
    let headers = serde_json::to_string(&response.headers)?;
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
      params![cache],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, url_hash, url, status, status_text, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        cache,
        url_hash(url),
        url,
        response.status,
        response.status_text,
        headers,
        response.body,
        Utc::now().to_rfc3339(),
      ],
    )?;

    tx.commit()?;
    Ok(())
  }

  fn match_in(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>, CacheStorageError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT url, status, status_text, headers, body, stored_at FROM cache_entries
         WHERE cache_name = ? AND url_hash = ?",
        params![cache, url_hash(url)],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u16>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Vec<u8>>(4)?,
            row.get::<_, String>(5)?,
          ))
        },
      )
      .optional()?;

    let Some((url, status, status_text, headers, body, stored_at)) = row else {
      return Ok(None);
    };

    Ok(Some(CachedResponse {
      url,
      response: Response {
        status,
        status_text,
        headers: serde_json::from_str(&headers)?,
        body,
      },
      stored_at: parse_datetime(&stored_at)?,
    }))
  }

  fn delete(&self, cache: &str) -> Result<bool, CacheStorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![cache])?;
    let removed = tx.execute("DELETE FROM cache_names WHERE name = ?", params![cache])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn urls(&self, cache: &str) -> Result<Vec<String>, CacheStorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY url")?;
    let urls = stmt
      .query_map(params![cache], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(urls)
  }
}

/// SHA256 of the URL for a stable, fixed-length row key.
fn url_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheStorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| CacheStorageError::Backend(format!("failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn html(body: &str) -> Response {
    Response::new(200, "OK", Some("text/html"), body.as_bytes().to_vec())
  }

  #[test]
  fn test_put_and_match() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.put("loft-cache-v2", "https://loft.example/", &html("home")).unwrap();

    let hit = storage
      .match_in("loft-cache-v2", "https://loft.example/")
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body, b"home");
    assert_eq!(hit.response.header("content-type"), Some("text/html"));
    assert!(storage.match_in("loft-assets-v2", "https://loft.example/").unwrap().is_none());
  }

  #[test]
  fn test_put_replaces_entry() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.put("c", "https://loft.example/", &html("old")).unwrap();
    storage.put("c", "https://loft.example/", &html("new")).unwrap();

    let hit = storage.match_in("c", "https://loft.example/").unwrap().unwrap();
    assert_eq!(hit.response.body, b"new");
    assert_eq!(storage.urls("c").unwrap().len(), 1);
  }

  #[test]
  fn test_match_any_respects_order() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.put("docs", "https://loft.example/a", &html("docs")).unwrap();
    storage.put("assets", "https://loft.example/a", &html("assets")).unwrap();

    let names = vec!["assets".to_string(), "docs".to_string()];
    let hit = storage.match_any(&names, "https://loft.example/a").unwrap().unwrap();
    assert_eq!(hit.response.body, b"assets");
  }

  #[test]
  fn test_delete_removes_cache_and_entries() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.open("empty").unwrap();
    storage.put("old", "https://loft.example/", &html("x")).unwrap();

    assert_eq!(storage.keys().unwrap().len(), 2);
    assert!(storage.delete("old").unwrap());
    assert!(!storage.delete("old").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["empty".to_string()]);
    assert!(storage.match_in("old", "https://loft.example/").unwrap().is_none());
  }
}
