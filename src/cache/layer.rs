//! Cache layer that orchestrates caching strategies with network fetching.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::storage::{CacheStorage, CacheStorageError};
use super::traits::{CacheResult, CachedResponse};
use crate::fetch::{FetchError, Fetcher, Request, Response};

/// A cache side effect that could not be applied.
///
/// Never fatal: the response is still returned to the caller.
#[derive(Debug, Error)]
#[error("failed to write {url} to cache {cache}: {source}")]
pub struct CacheWriteError {
  pub cache: String,
  pub url: String,
  #[source]
  pub source: CacheStorageError,
}

/// Cache layer that applies caching strategies around a network fetcher.
///
/// Every strategy resolves to some [`Response`]; storage and network errors
/// are turned into fallbacks rather than surfaced.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  /// Upper bound on a single network attempt
  fetch_timeout: Duration,
}

impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      storage,
      fetcher,
      fetch_timeout: Duration::from_secs(10),
    }
  }

  pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
    self.fetch_timeout = fetch_timeout;
    self
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Fetch from the network, bounded by the fetch timeout.
  pub async fn fetch_network(&self, request: &Request) -> Result<Response, FetchError> {
    match timeout(self.fetch_timeout, self.fetcher.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout(self.fetch_timeout)),
    }
  }

  /// Store a successful response under `url`. Non-2xx responses are skipped.
  pub fn store(&self, cache: &str, url: &str, response: &Response) -> Result<(), CacheWriteError> {
    if !response.ok() {
      debug!(url, status = response.status, "not caching unsuccessful response");
      return Ok(());
    }
    self
      .storage
      .put(cache, url, response)
      .map_err(|source| CacheWriteError {
        cache: cache.to_string(),
        url: url.to_string(),
        source,
      })
  }

  fn lookup(&self, caches: &[String], url: &str) -> Option<CachedResponse> {
    match self.storage.match_any(caches, url) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url, error = %e, "cache lookup failed, treating as miss");
        None
      }
    }
  }

  fn store_or_log(&self, cache: &str, url: &str, response: &Response) {
    if let Err(e) = self.store(cache, url, response) {
      warn!(error = %e, "cache write skipped");
    }
  }

  /// Network-first with cache fallback, for page navigations.
  ///
  /// 1. Try the network; store a copy of a successful response in `cache`
  ///    and return whatever came back
  /// 2. On failure, return the cached entry for the URL
  /// 3. Else the cached `fallback_url` (the root document)
  /// 4. Else the built-in offline page
  pub async fn network_first(
    &self,
    request: &Request,
    cache: &str,
    lookup: &[String],
    fallback_url: &str,
  ) -> CacheResult<Response> {
    let url = request.cache_key();

    match self.fetch_network(request).await {
      Ok(response) => {
        self.store_or_log(cache, &url, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(%url, error = %e, "navigation fetch failed, falling back to cache");
        if let Some(hit) = self.lookup(lookup, &url) {
          return CacheResult::from_cache(hit.response, hit.stored_at);
        }
        if let Some(hit) = self.lookup(lookup, fallback_url) {
          return CacheResult::from_cache(hit.response, hit.stored_at);
        }
        CacheResult::fallback(Response::offline_page())
      }
    }
  }

  /// Cache-first with network refill, for assets and GET API calls.
  ///
  /// 1. Return a cached match immediately if present
  /// 2. Otherwise fetch, store a copy in `cache`, return it
  /// 3. On network failure, return an image placeholder or an offline status
  pub async fn cache_first(
    &self,
    request: &Request,
    cache: &str,
    lookup: &[String],
  ) -> CacheResult<Response> {
    let url = request.cache_key();

    if let Some(hit) = self.lookup(lookup, &url) {
      return CacheResult::from_cache(hit.response, hit.stored_at);
    }

    match self.fetch_network(request).await {
      Ok(response) => {
        self.store_or_log(cache, &url, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(%url, error = %e, "asset fetch failed with no cached copy");
        if request.is_image() {
          CacheResult::fallback(Response::image_placeholder())
        } else {
          CacheResult::fallback(Response::offline_status())
        }
      }
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      fetch_timeout: self.fetch_timeout,
    }
  }
}
