//! Hosts the cache manager versions: registration, the waiting slot and the
//! controller handoff.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::fetch::{FetchError, Fetcher, Request, Response};
use crate::worker::{
  spawn_worker, CacheManager, FetchOutcome, WorkerError, WorkerEvent, WorkerHandle, WorkerSettings,
};

/// Lifecycle notifications delivered to every open page.
#[derive(Debug, Clone)]
pub enum ClientEvent {
  /// A new version installed and is waiting behind the current controller.
  UpdateWaiting { version: String, worker: WorkerHandle },
  /// A new version took control of the pages.
  ControllerChange { version: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
  /// No controller existed; the worker activated right away.
  Activated,
  Waiting,
}

#[derive(Debug)]
enum RuntimeCommand {
  Register {
    settings: WorkerSettings,
    reply: oneshot::Sender<Result<RegisterOutcome, WorkerError>>,
  },
}

/// Page-side handle to the runtime.
pub struct RuntimeHandle<F: Fetcher> {
  tx: mpsc::Sender<RuntimeCommand>,
  controller: watch::Receiver<Option<WorkerHandle>>,
  clients: broadcast::Sender<ClientEvent>,
  fetcher: Arc<F>,
}

impl<F: Fetcher> Clone for RuntimeHandle<F> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      controller: self.controller.clone(),
      clients: self.clients.clone(),
      fetcher: Arc::clone(&self.fetcher),
    }
  }
}

impl<F: Fetcher> RuntimeHandle<F> {
  /// Install a new version. Resolves once it is active or waiting.
  pub async fn register(&self, settings: WorkerSettings) -> Result<RegisterOutcome, WorkerError> {
    let version = settings.version.to_string();
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(RuntimeCommand::Register { settings, reply })
      .await
      .map_err(|_| WorkerError::Gone(version.clone()))?;
    rx.await.map_err(|_| WorkerError::Gone(version))?
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
    self.clients.subscribe()
  }

  pub fn controller_version(&self) -> Option<String> {
    self
      .controller
      .borrow()
      .as_ref()
      .map(|worker| worker.version().to_string())
  }

  /// Issue a request the way a page does: through the controller when there
  /// is one, straight to the network otherwise.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>, FetchError> {
    let controller = self.controller.borrow().clone();
    if let Some(worker) = controller {
      if let FetchOutcome::Respond(result) = worker.fetch(request.clone()).await {
        return Ok(result);
      }
    }
    self
      .fetcher
      .fetch(&request)
      .await
      .map(CacheResult::from_network)
  }
}

/// Start the runtime actor.
pub fn spawn_runtime<S, F>(storage: Arc<S>, fetcher: Arc<F>, fetch_timeout: Duration) -> RuntimeHandle<F>
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  let (tx, commands) = mpsc::channel(8);
  let (events_tx, events) = mpsc::unbounded_channel();
  let (controller_tx, controller) = watch::channel(None);
  let (clients, _) = broadcast::channel(16);

  let runtime = Runtime {
    storage,
    fetcher: Arc::clone(&fetcher),
    fetch_timeout,
    next_id: 0,
    active: None,
    waiting: None,
    controller: controller_tx,
    clients: clients.clone(),
    events_tx,
  };
  tokio::spawn(runtime.run(commands, events));

  RuntimeHandle {
    tx,
    controller,
    clients,
    fetcher,
  }
}

struct Runtime<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  fetch_timeout: Duration,
  next_id: u64,
  active: Option<WorkerHandle>,
  waiting: Option<WorkerHandle>,
  controller: watch::Sender<Option<WorkerHandle>>,
  clients: broadcast::Sender<ClientEvent>,
  events_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl<S: CacheStorage + 'static, F: Fetcher> Runtime<S, F> {
  async fn run(
    mut self,
    mut commands: mpsc::Receiver<RuntimeCommand>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
  ) {
    loop {
      tokio::select! {
        command = commands.recv() => match command {
          Some(RuntimeCommand::Register { settings, reply }) => {
            let _ = reply.send(self.register(settings).await);
          }
          None => break,
        },
        Some(event) = events.recv() => self.on_event(event).await,
      }
    }
    debug!("worker runtime stopped");
  }

  async fn register(&mut self, settings: WorkerSettings) -> Result<RegisterOutcome, WorkerError> {
    self.next_id += 1;
    let layer = CacheLayer::new(Arc::clone(&self.storage), Arc::clone(&self.fetcher))
      .with_fetch_timeout(self.fetch_timeout);
    let worker = spawn_worker(
      CacheManager::new(settings, layer),
      self.next_id,
      self.events_tx.clone(),
    );

    if let Err(e) = worker.install().await {
      warn!(version = worker.version(), error = %e, "cache manager install failed");
      return Err(e);
    }

    if self.active.is_none() {
      self.promote(worker).await?;
      return Ok(RegisterOutcome::Activated);
    }

    if let Some(previous) = self.waiting.replace(worker.clone()) {
      debug!(version = previous.version(), "waiting worker superseded");
      previous.retire().await;
    }
    info!(version = worker.version(), "update installed and waiting");
    let _ = self.clients.send(ClientEvent::UpdateWaiting {
      version: worker.version().to_string(),
      worker,
    });
    Ok(RegisterOutcome::Waiting)
  }

  async fn on_event(&mut self, event: WorkerEvent) {
    match event {
      WorkerEvent::SkipWaitingRequested { worker } => {
        if self.waiting.as_ref().map(WorkerHandle::id) != Some(worker) {
          debug!(worker, "skip-waiting from a worker that is not waiting");
          return;
        }
        let Some(waiting) = self.waiting.take() else {
          return;
        };
        let version = waiting.version().to_string();
        match self.promote(waiting).await {
          Ok(()) => {
            let _ = self.clients.send(ClientEvent::ControllerChange { version });
          }
          Err(e) => warn!(%version, error = %e, "activation failed"),
        }
      }
    }
  }

  async fn promote(&mut self, worker: WorkerHandle) -> Result<(), WorkerError> {
    worker.activate().await?;
    if let Some(old) = self.active.replace(worker.clone()) {
      old.retire().await;
    }
    info!(version = worker.version(), "cache manager now controls pages");
    self.controller.send_replace(Some(worker));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CacheVersion, MemoryCacheStorage};
  use crate::test_support::FakeNetwork;
  use crate::worker::{Manifest, WorkerMessage};
  use url::Url;

  fn settings(version: &str) -> WorkerSettings {
    WorkerSettings {
      origin: Url::parse("https://loft.example").unwrap(),
      version: CacheVersion::new(version),
      manifest: Manifest::default(),
    }
  }

  fn runtime() -> (Arc<MemoryCacheStorage>, Arc<FakeNetwork>, RuntimeHandle<FakeNetwork>) {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = Arc::new(FakeNetwork::new());
    network.serve("/", "text/html", "shell");
    network.serve("/manifest.webmanifest", "application/manifest+json", "{}");
    let handle = spawn_runtime(Arc::clone(&storage), Arc::clone(&network), Duration::from_secs(5));
    (storage, network, handle)
  }

  #[tokio::test]
  async fn test_first_registration_takes_control() {
    let (_storage, _network, runtime) = runtime();
    let mut events = runtime.subscribe();

    assert_eq!(runtime.register(settings("v1")).await.unwrap(), RegisterOutcome::Activated);
    assert_eq!(runtime.controller_version().as_deref(), Some("v1"));
    assert!(events.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_update_waits_then_replaces_controller() {
    let (storage, _network, runtime) = runtime();
    runtime.register(settings("v1")).await.unwrap();
    let mut events = runtime.subscribe();

    assert_eq!(runtime.register(settings("v2")).await.unwrap(), RegisterOutcome::Waiting);
    assert_eq!(runtime.controller_version().as_deref(), Some("v1"));

    let ClientEvent::UpdateWaiting { version, worker } = events.recv().await.unwrap() else {
      panic!("expected an update notice");
    };
    assert_eq!(version, "v2");
    worker.post_message(WorkerMessage::SkipWaiting).await;

    let ClientEvent::ControllerChange { version } = events.recv().await.unwrap() else {
      panic!("expected a controller change");
    };
    assert_eq!(version, "v2");
    assert_eq!(runtime.controller_version().as_deref(), Some("v2"));

    let mut keys = storage.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["loft-assets-v2".to_string(), "loft-cache-v2".to_string()]);
  }

  #[tokio::test]
  async fn test_failed_install_leaves_controller_alone() {
    let (_storage, network, runtime) = runtime();
    runtime.register(settings("v1")).await.unwrap();
    network.respond("/manifest.webmanifest", Response::new(404, "Not Found", None, Vec::new()));

    assert!(runtime.register(settings("v2")).await.is_err());
    assert_eq!(runtime.controller_version().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_fetch_routes_through_controller() {
    let (_storage, network, runtime) = runtime();
    network.serve("/app.js", "text/javascript", "js");
    let request = Request::get(Url::parse("https://loft.example/app.js").unwrap());

    let direct = runtime.fetch(request.clone()).await.unwrap();
    assert_eq!(direct.source, CacheSource::Network);

    runtime.register(settings("v1")).await.unwrap();
    runtime.fetch(request.clone()).await.unwrap();
    network.set_offline(true);
    let cached = runtime.fetch(request).await.unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data.body, b"js");
  }

  #[tokio::test]
  async fn test_post_bypasses_worker() {
    let (_storage, network, runtime) = runtime();
    runtime.register(settings("v1")).await.unwrap();
    network.set_offline(true);

    let post = Request::get(Url::parse("https://loft.example/api/offline-submit").unwrap())
      .with_method(reqwest::Method::POST);
    assert!(runtime.fetch(post).await.is_err());
  }
}
