//! One-shot CLI subcommands.

use clap::Args;
use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::cache::{CacheLayer, CacheNamespace, CacheStorage, SqliteCacheStorage};
use crate::config::Config;
use crate::fetch::{HttpFetcher, Request};
use crate::queue::{AttachmentMeta, FieldValue, Fields, QueueError, QueueStore, ReportKind};
use crate::store::{DurableStore, MemoryStore, SqliteStore};
use crate::sync::{FlushOrchestrator, FlushReport, HttpTransport, SubmitOutcome};
use crate::worker::{CacheManager, FetchOutcome};

pub type Queue = QueueStore<Box<dyn DurableStore>>;
pub type Orchestrator = FlushOrchestrator<Box<dyn DurableStore>, HttpTransport>;

/// A report as typed on the command line.
#[derive(Debug, Args)]
pub struct ReportArgs {
  /// Which form the report comes from (lost or found)
  pub kind: ReportKind,

  /// Text field, repeatable: -f title="Black umbrella"
  #[arg(short = 'f', long = "field", value_parser = parse_pair)]
  pub fields: Vec<(String, String)>,

  /// Attach a file by path: --attach photo=./umbrella.jpg
  #[arg(long = "attach", value_parser = parse_pair)]
  pub attachments: Vec<(String, String)>,
}

impl ReportArgs {
  /// Form fields in command-line order, attachments last.
  pub fn to_fields(&self) -> Result<Fields> {
    let mut fields: Fields = self
      .fields
      .iter()
      .map(|(name, value)| (name.clone(), FieldValue::from(value.as_str())))
      .collect();
    for (name, path) in &self.attachments {
      fields.push((name.clone(), FieldValue::Attachment(attachment_meta(Path::new(path))?)));
    }
    Ok(fields)
  }
}

fn parse_pair(raw: &str) -> std::result::Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(name, value)| (name.trim().to_string(), value.to_string()))
    .ok_or_else(|| format!("expected name=value, got '{}'", raw))
}

fn attachment_meta(path: &Path) -> Result<AttachmentMeta> {
  let metadata = std::fs::metadata(path)
    .map_err(|e| eyre!("Cannot read attachment {}: {}", path.display(), e))?;
  let name = path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_default();
  Ok(AttachmentMeta {
    name,
    mime_type: mime_type(path).to_string(),
    size: metadata.len(),
  })
}

fn mime_type(path: &Path) -> &'static str {
  let extension = path
    .extension()
    .map(|ext| ext.to_string_lossy().to_lowercase())
    .unwrap_or_default();
  match extension.as_str() {
    "jpg" | "jpeg" => "image/jpeg",
    "png" => "image/png",
    "webp" => "image/webp",
    "gif" => "image/gif",
    "heic" => "image/heic",
    "pdf" => "application/pdf",
    _ => "application/octet-stream",
  }
}

fn ensure_parent(path: &Path) -> Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create data directory {}: {}", parent.display(), e))?;
  }
  Ok(())
}

/// Open the queue over SQLite, or in memory for `--ephemeral` runs.
pub fn open_queue(config: &Config, ephemeral: bool) -> Result<Arc<Queue>> {
  let store: Box<dyn DurableStore> = if ephemeral {
    Box::new(MemoryStore::new())
  } else {
    let path = config.database_path()?;
    ensure_parent(&path)?;
    Box::new(SqliteStore::open(&path, &config.queue.namespace)?)
  };

  let queue = QueueStore::new(store)?
    .with_attachment_policy(config.queue.attachments)
    .with_compaction_threshold(config.queue.compact_after);
  Ok(Arc::new(queue))
}

pub fn open_orchestrator(config: &Config, queue: Arc<Queue>) -> Result<Orchestrator> {
  let transport = HttpTransport::new(&config.backend_url()?, config.request_timeout())?;
  Ok(FlushOrchestrator::new(queue, transport, config.flush_settings()))
}

pub fn open_cache_storage(config: &Config, ephemeral: bool) -> Result<Arc<SqliteCacheStorage>> {
  let storage = if ephemeral {
    SqliteCacheStorage::in_memory()?
  } else {
    let path = config.database_path()?;
    ensure_parent(&path)?;
    SqliteCacheStorage::open(&path)?
  };
  Ok(Arc::new(storage))
}

pub fn enqueue(config: &Config, ephemeral: bool, report: &ReportArgs) -> Result<()> {
  let queue = open_queue(config, ephemeral)?;
  match queue.enqueue(report.kind, report.to_fields()?) {
    Ok(id) => println!("queued {} ({} pending)", id, queue.pending_count()?),
    Err(QueueError::StorageQuota { id, source }) => {
      println!("queued {} in memory only, it will be lost on exit: {}", id, source)
    }
    Err(e) => return Err(e.into()),
  }
  Ok(())
}

pub async fn submit(config: &Config, ephemeral: bool, report: &ReportArgs, offline: bool) -> Result<()> {
  let queue = open_queue(config, ephemeral)?;
  let orchestrator = open_orchestrator(config, queue)?;

  match orchestrator.submit(report.kind, report.to_fields()?, !offline).await {
    Ok(SubmitOutcome::Delivered(id)) => println!("delivered {}", id),
    Ok(SubmitOutcome::Queued(id)) => println!("backend unreachable, queued {} for later", id),
    Ok(SubmitOutcome::Rejected(failure)) => {
      println!("rejected {}: {}", failure.id, failure.reason)
    }
    Err(QueueError::StorageQuota { id, source }) => {
      println!("could not queue {} durably, it will be lost on exit: {}", id, source)
    }
    Err(e) => return Err(e.into()),
  }
  Ok(())
}

pub fn status(config: &Config, ephemeral: bool) -> Result<()> {
  let queue = open_queue(config, ephemeral)?;
  let pending = queue.list_pending()?;

  println!("{} pending submission(s)", pending.len());
  for item in pending {
    println!(
      "  {}  {:<5}  {}  {} field(s)",
      item.id,
      item.kind,
      item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
      item.fields.len()
    );
  }
  Ok(())
}

pub async fn flush(config: &Config, ephemeral: bool) -> Result<()> {
  let queue = open_queue(config, ephemeral)?;
  let orchestrator = open_orchestrator(config, queue)?;

  print_report(&orchestrator.flush().await);
  Ok(())
}

pub fn print_report(report: &FlushReport) {
  println!(
    "attempted {}, delivered {}, failed {}, deferred {}",
    report.attempted, report.succeeded, report.failed, report.deferred
  );
  for failure in &report.failures {
    println!("  rejected {}: {}", failure.id, failure.reason);
  }
}

pub fn clear(config: &Config, ephemeral: bool) -> Result<()> {
  let queue = open_queue(config, ephemeral)?;
  let dropped = queue.pending_count()?;
  queue.clear()?;
  println!("dropped {} pending submission(s)", dropped);
  Ok(())
}

pub fn compact(config: &Config, ephemeral: bool) -> Result<()> {
  let queue = open_queue(config, ephemeral)?;
  let records = queue.compact()?;
  println!("queue log compacted to {} record(s)", records);
  Ok(())
}

type Manager = CacheManager<SqliteCacheStorage, HttpFetcher>;

fn cache_manager(config: &Config, storage: Arc<SqliteCacheStorage>) -> Result<Manager> {
  let layer = CacheLayer::new(storage, Arc::new(HttpFetcher::new()?))
    .with_fetch_timeout(config.fetch_timeout());
  Ok(CacheManager::new(config.worker_settings()?, layer))
}

/// Precache the configured version and evict every other generation.
pub async fn cache_install(config: &Config, ephemeral: bool) -> Result<()> {
  let storage = open_cache_storage(config, ephemeral)?;
  let mut manager = cache_manager(config, storage)?;

  let report = manager.install().await?;
  let deleted = manager.activate()?;
  println!(
    "cache {} installed: {} precached, {} optional skipped",
    manager.version(),
    report.precached,
    report.skipped
  );
  for name in deleted {
    println!("  evicted {}", name);
  }
  Ok(())
}

#[derive(Debug, Args)]
pub struct FetchArgs {
  /// Absolute URL, or a path relative to the configured origin
  pub url: String,

  /// Treat the request as a page navigation
  #[arg(long)]
  pub navigate: bool,

  /// HTTP method
  #[arg(long, default_value = "GET")]
  pub method: String,

  /// Accept header
  #[arg(long)]
  pub accept: Option<String>,
}

/// Issue one request through the cache manager, installing the current
/// version first if it has never been installed.
pub async fn cache_fetch(config: &Config, ephemeral: bool, args: &FetchArgs) -> Result<()> {
  let storage = open_cache_storage(config, ephemeral)?;
  let mut manager = cache_manager(config, Arc::clone(&storage))?;

  let documents = manager.version().cache_name(CacheNamespace::Documents);
  if !storage.keys()?.contains(&documents) {
    info!(cache = %documents, "current generation missing, installing first");
    manager.install().await?;
  }
  manager.activate()?;

  let url = resolve_url(config, &args.url)?;
  let method = reqwest::Method::from_bytes(args.method.to_uppercase().as_bytes())
    .map_err(|_| eyre!("Invalid HTTP method '{}'", args.method))?;
  let mut request = if args.navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  }
  .with_method(method);
  if let Some(accept) = &args.accept {
    request = request.with_accept(accept);
  }

  match manager.handle_fetch(&request).await {
    FetchOutcome::Respond(result) => {
      let response = &result.data;
      println!("{} {} (from {:?})", response.status, response.status_text, result.source);
      if let Some(cached_at) = result.cached_at {
        println!("cached at {}", cached_at.to_rfc3339());
      }
      if let Some(content_type) = response.header("content-type") {
        println!("content-type: {}", content_type);
      }
      println!("{} byte(s)", response.body.len());
    }
    FetchOutcome::Passthrough => println!("not handled by the cache manager"),
  }
  Ok(())
}

fn resolve_url(config: &Config, raw: &str) -> Result<Url> {
  match Url::parse(raw) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => {
      let origin = config.worker_settings()?.origin;
      origin
        .join(raw)
        .map_err(|e| eyre!("Invalid URL '{}': {}", raw, e))
    }
    Err(e) => Err(eyre!("Invalid URL '{}': {}", raw, e)),
  }
}

pub fn cache_list(config: &Config, ephemeral: bool) -> Result<()> {
  let storage = open_cache_storage(config, ephemeral)?;
  let current = config.cache_version().current_names();

  let names = storage.keys()?;
  if names.is_empty() {
    println!("no caches");
  }
  for name in names {
    let marker = if current.contains(&name) { "*" } else { " " };
    let urls = storage.urls(&name)?;
    println!("{} {} ({} entries)", marker, name, urls.len());
    for url in urls {
      println!("    {}", url);
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_pair() {
    assert_eq!(
      parse_pair("title=Black umbrella").unwrap(),
      ("title".to_string(), "Black umbrella".to_string())
    );
    assert_eq!(parse_pair("note=a=b").unwrap().1, "a=b");
    assert!(parse_pair("title").is_err());
  }

  #[test]
  fn test_attachment_metadata_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Umbrella.JPG");
    std::fs::write(&path, [0u8; 42]).unwrap();

    let report = ReportArgs {
      kind: ReportKind::Found,
      fields: vec![("title".to_string(), "Umbrella".to_string())],
      attachments: vec![("photo".to_string(), path.display().to_string())],
    };
    let fields = report.to_fields().unwrap();

    assert_eq!(fields[0].0, "title");
    assert_eq!(
      fields[1].1,
      FieldValue::Attachment(AttachmentMeta {
        name: "Umbrella.JPG".to_string(),
        mime_type: "image/jpeg".to_string(),
        size: 42,
      })
    );
  }

  #[test]
  fn test_ephemeral_queue_keeps_items_in_memory() {
    let config = Config::default();
    let queue = open_queue(&config, true).unwrap();
    let id = queue
      .enqueue(ReportKind::Lost, vec![("title".to_string(), "Keys".into())])
      .unwrap();
    assert_eq!(queue.list_pending().unwrap()[0].id, id);
  }

  #[test]
  fn test_relative_urls_resolve_against_origin() {
    let config = Config::default();
    assert_eq!(
      resolve_url(&config, "/icons/icon-192.png").unwrap().as_str(),
      "http://localhost:3000/icons/icon-192.png"
    );
  }
}
