//! Lifecycle and fetch dispatch of one cache manager version.

use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheLayer, CacheNamespace, CacheResult, CacheStorage, CacheStorageError, CacheVersion,
};
use crate::fetch::{Fetcher, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  /// Installed, waiting for the previous version to let go.
  Waiting,
  Activating,
  Active,
  Redundant,
}

impl WorkerState {
  fn intercepts_fetches(self) -> bool {
    matches!(self, WorkerState::Activating | WorkerState::Active)
  }
}

/// Shell assets precached at install time, as paths relative to the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
  /// Must all succeed or the install fails.
  pub required: Vec<String>,
  /// Attempted independently; failures are ignored.
  pub optional: Vec<String>,
}

impl Default for Manifest {
  fn default() -> Self {
    Self {
      required: vec!["/".to_string(), "/manifest.webmanifest".to_string()],
      optional: vec![
        "/icons/icon-192.png".to_string(),
        "/icons/icon-512.png".to_string(),
        "/icons/maskable-512.png".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub origin: Url,
  pub version: CacheVersion,
  pub manifest: Manifest,
}

#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("required asset {url} could not be precached: {reason}")]
  Precache { url: String, reason: String },
  #[error("invalid manifest entry '{entry}': {reason}")]
  Manifest { entry: String, reason: String },
  #[error("cache storage failed: {0}")]
  Storage(#[from] CacheStorageError),
  #[error("worker {0} is no longer running")]
  Gone(String),
}

/// What the interceptor decided to do with a request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  Respond(CacheResult<Response>),
  /// Not handled here; the caller goes to the network directly.
  Passthrough,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub precached: usize,
  pub skipped: usize,
}

/// One version of the cache manager.
///
/// Cloning snapshots the lifecycle state and shares the cache layer.
pub struct CacheManager<S: CacheStorage, F: Fetcher> {
  settings: Arc<WorkerSettings>,
  layer: CacheLayer<S, F>,
  state: WorkerState,
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheManager<S, F> {
  fn clone(&self) -> Self {
    Self {
      settings: Arc::clone(&self.settings),
      layer: self.layer.clone(),
      state: self.state,
    }
  }
}

impl<S: CacheStorage, F: Fetcher> CacheManager<S, F> {
  pub fn new(settings: WorkerSettings, layer: CacheLayer<S, F>) -> Self {
    Self {
      settings: Arc::new(settings),
      layer,
      state: WorkerState::Installing,
    }
  }

  pub fn version(&self) -> &CacheVersion {
    &self.settings.version
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  /// Precache the manifest into the document generation.
  ///
  /// On success the worker waits to be activated. A missing required asset
  /// makes the worker redundant.
  pub async fn install(&mut self) -> Result<InstallReport, WorkerError> {
    self.state = WorkerState::Installing;
    let version = &self.settings.version;
    let documents = version.cache_name(CacheNamespace::Documents);
    let storage = self.layer.storage();
    storage.open(&documents)?;
    storage.open(&version.cache_name(CacheNamespace::Assets))?;

    let required = match self.resolve(&self.settings.manifest.required) {
      Ok(urls) => urls,
      Err(e) => {
        self.state = WorkerState::Redundant;
        return Err(e);
      }
    };
    let optional: Vec<Url> = self
      .settings
      .manifest
      .optional
      .iter()
      .filter_map(|entry| match self.settings.origin.join(entry) {
        Ok(url) => Some(url),
        Err(e) => {
          warn!(entry, error = %e, "ignoring invalid optional manifest entry");
          None
        }
      })
      .collect();

    let (required_results, optional_results) = futures::join!(
      join_all(required.iter().map(|url| self.precache(&documents, url))),
      join_all(optional.iter().map(|url| self.precache(&documents, url))),
    );

    let mut report = InstallReport::default();
    for (url, result) in optional.iter().zip(optional_results) {
      match result {
        Ok(()) => report.precached += 1,
        Err(reason) => {
          debug!(%url, %reason, "optional asset not precached");
          report.skipped += 1;
        }
      }
    }
    for (url, result) in required.iter().zip(required_results) {
      if let Err(reason) = result {
        self.state = WorkerState::Redundant;
        return Err(WorkerError::Precache {
          url: url.to_string(),
          reason,
        });
      }
      report.precached += 1;
    }

    self.state = WorkerState::Waiting;
    info!(
      version = %version,
      precached = report.precached,
      skipped = report.skipped,
      "cache manager installed"
    );
    Ok(report)
  }

  /// Delete every cache generation that is not current, then take control.
  pub fn activate(&mut self) -> Result<Vec<String>, WorkerError> {
    self.state = WorkerState::Activating;
    let current = self.settings.version.current_names();
    let storage = self.layer.storage();

    let mut deleted = Vec::new();
    for name in storage.keys()? {
      if current.contains(&name) {
        continue;
      }
      if storage.delete(&name)? {
        deleted.push(name);
      }
    }

    self.state = WorkerState::Active;
    info!(version = %self.settings.version, ?deleted, "cache manager activated");
    Ok(deleted)
  }

  pub fn retire(&mut self) {
    if self.state != WorkerState::Redundant {
      debug!(version = %self.settings.version, "cache manager retired");
    }
    self.state = WorkerState::Redundant;
  }

  /// Intercept one request. Never fails: every handled request resolves to a
  /// response.
  pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
    if !self.state.intercepts_fetches() || request.method != reqwest::Method::GET {
      return FetchOutcome::Passthrough;
    }

    let version = &self.settings.version;
    let current = version.current_names();

    let result = if request.is_navigation() {
      let root = self.settings.origin.join("/").map(String::from).unwrap_or_default();
      self
        .layer
        .network_first(
          request,
          &version.cache_name(CacheNamespace::Documents),
          &current,
          &root,
        )
        .await
    } else {
      self
        .layer
        .cache_first(request, &version.cache_name(CacheNamespace::Assets), &current)
        .await
    };

    FetchOutcome::Respond(result)
  }

  fn resolve(&self, entries: &[String]) -> Result<Vec<Url>, WorkerError> {
    entries
      .iter()
      .map(|entry| {
        self
          .settings
          .origin
          .join(entry)
          .map_err(|e| WorkerError::Manifest {
            entry: entry.clone(),
            reason: e.to_string(),
          })
      })
      .collect()
  }

  async fn precache(&self, cache: &str, url: &Url) -> Result<(), String> {
    let request = Request::get(url.clone());
    let response = self
      .layer
      .fetch_network(&request)
      .await
      .map_err(|e| e.to_string())?;
    if !response.ok() {
      return Err(format!("status {}", response.status));
    }
    self
      .layer
      .store(cache, &request.cache_key(), &response)
      .map_err(|e| e.to_string())
  }
}
