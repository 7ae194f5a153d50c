//! Core types for the response cache.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::fetch::Response;

/// The two logical cache namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
  /// Navigable pages and the precached shell.
  Documents,
  /// Static assets and GET API responses.
  Assets,
}

/// Version tags naming the current cache generation of each namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion {
  pub version: String,
  pub document_prefix: String,
  pub asset_prefix: String,
}

impl CacheVersion {
  pub fn new(version: &str) -> Self {
    Self {
      version: version.to_string(),
      document_prefix: "loft-cache".to_string(),
      asset_prefix: "loft-assets".to_string(),
    }
  }

  pub fn with_prefixes(mut self, documents: &str, assets: &str) -> Self {
    self.document_prefix = documents.to_string();
    self.asset_prefix = assets.to_string();
    self
  }

  /// Name of this version's generation in `namespace`, e.g. `loft-cache-v2`.
  pub fn cache_name(&self, namespace: CacheNamespace) -> String {
    let prefix = match namespace {
      CacheNamespace::Documents => &self.document_prefix,
      CacheNamespace::Assets => &self.asset_prefix,
    };
    format!("{}-{}", prefix, self.version)
  }

  /// Both current generation names, documents first.
  pub fn current_names(&self) -> [String; 2] {
    [
      self.cache_name(CacheNamespace::Documents),
      self.cache_name(CacheNamespace::Assets),
    ]
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.version)
  }
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub url: String,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data served from a cache generation.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Synthesized answer when neither network nor cache could help.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  Cache,
  Fallback,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_names() {
    let version = CacheVersion::new("v2");
    assert_eq!(version.cache_name(CacheNamespace::Documents), "loft-cache-v2");
    assert_eq!(version.cache_name(CacheNamespace::Assets), "loft-assets-v2");

    let custom = CacheVersion::new("v3").with_prefixes("docs", "static");
    assert_eq!(custom.current_names(), ["docs-v3".to_string(), "static-v3".to_string()]);
  }
}
