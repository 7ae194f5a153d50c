use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheVersion;
use crate::queue::AttachmentPolicy;
use crate::sync::{FlushSettings, PeriodicSchedule};
use crate::worker::{Manifest, WorkerSettings};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub queue: QueueConfig,
  pub sync: SyncConfig,
  pub cache: CacheConfig,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// API root; submissions go to `<base_url>/offline-submit`
  pub base_url: String,
  pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000/api/".to_string(),
      request_timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub namespace: String,
  /// Log records written before the queue log is compacted
  pub compact_after: usize,
  pub attachments: AttachmentPolicy,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      namespace: "loft_offline_queue_v1".to_string(),
      compact_after: 64,
      attachments: AttachmentPolicy::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_batch_size: usize,
  pub debounce_ms: u64,
  pub probe_interval_secs: u64,
  pub periodic_interval_secs: u64,
  pub backoff_cap_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_batch_size: FlushSettings::default().max_batch_size,
      debounce_ms: 2_000,
      probe_interval_secs: 15,
      periodic_interval_secs: 60,
      backoff_cap_secs: 15 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Origin the app shell is served from
  pub origin: String,
  pub version: String,
  pub document_prefix: String,
  pub asset_prefix: String,
  pub fetch_timeout_secs: u64,
  pub required: Vec<String>,
  pub optional: Vec<String>,
  /// Accept waiting updates without asking (for the `run` agent)
  pub auto_update: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let version = CacheVersion::new("v1");
    let manifest = Manifest::default();
    Self {
      origin: "http://localhost:3000/".to_string(),
      version: version.version,
      document_prefix: version.document_prefix,
      asset_prefix: version.asset_prefix,
      fetch_timeout_secs: 10,
      required: manifest.required,
      optional: manifest.optional,
      auto_update: false,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Overrides the platform data directory
  pub data_dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  ///
  /// With no file anywhere the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty document deserializes to null, not to an empty mapping.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Directory holding the database and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.storage.data_dir {
      return Ok(dir.clone());
    }
    dirs::data_dir()
      .map(|dir| dir.join("fieldsync"))
      .ok_or_else(|| eyre!("No data directory available; set storage.data_dir"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("fieldsync.db"))
  }

  /// Backend API root, always ending in a slash so relative joins keep the
  /// path.
  pub fn backend_url(&self) -> Result<Url> {
    parse_base(&self.backend.base_url, "backend.base_url")
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.backend.request_timeout_secs)
  }

  pub fn flush_settings(&self) -> FlushSettings {
    FlushSettings {
      max_batch_size: self.sync.max_batch_size,
    }
  }

  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.sync.debounce_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs)
  }

  pub fn schedule(&self) -> PeriodicSchedule {
    PeriodicSchedule::new(
      Duration::from_secs(self.sync.periodic_interval_secs),
      Duration::from_secs(self.sync.backoff_cap_secs),
    )
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.cache.fetch_timeout_secs)
  }

  pub fn cache_version(&self) -> CacheVersion {
    CacheVersion::new(&self.cache.version)
      .with_prefixes(&self.cache.document_prefix, &self.cache.asset_prefix)
  }

  pub fn worker_settings(&self) -> Result<WorkerSettings> {
    Ok(WorkerSettings {
      origin: parse_base(&self.cache.origin, "cache.origin")?,
      version: self.cache_version(),
      manifest: Manifest {
        required: self.cache.required.clone(),
        optional: self.cache.optional.clone(),
      },
    })
  }
}

fn parse_base(raw: &str, key: &str) -> Result<Url> {
  let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid {} '{}': {}", key, raw, e))?;
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.queue.namespace, "loft_offline_queue_v1");
    assert_eq!(config.queue.attachments, AttachmentPolicy::Refuse);
    assert_eq!(config.sync.max_batch_size, 20);
    assert_eq!(config.cache_version().current_names()[0], "loft-cache-v1");
    assert_eq!(config.worker_settings().unwrap().manifest, Manifest::default());
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::parse(
      "backend:\n  base_url: https://loft.example/api\nqueue:\n  attachments: metadata-only\ncache:\n  version: v7\n",
    )
    .unwrap();

    assert_eq!(config.backend.request_timeout_secs, 15);
    assert_eq!(config.queue.attachments, AttachmentPolicy::MetadataOnly);
    assert_eq!(config.queue.compact_after, 64);
    assert_eq!(config.cache_version().current_names()[1], "loft-assets-v7");
    assert_eq!(
      config.backend_url().unwrap().join("offline-submit").unwrap().as_str(),
      "https://loft.example/api/offline-submit"
    );
  }

  #[test]
  fn test_load_from_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldsync.yaml");
    std::fs::write(&path, "storage:\n  data_dir: /tmp/fieldsync-test\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/fieldsync-test"));
    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }

  #[test]
  fn test_zero_periodic_interval_is_clamped() {
    let config = Config::parse("sync:\n  periodic_interval_secs: 0\n  backoff_cap_secs: 0\n").unwrap();
    assert_eq!(config.schedule().delay(), Duration::from_secs(1));
  }

  #[test]
  fn test_invalid_origin_is_reported() {
    let config = Config::parse("cache:\n  origin: not a url\n").unwrap();
    assert!(config.worker_settings().is_err());
  }
}
