//! Runs a [`CacheManager`] as an actor driven over typed channels.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::manager::{CacheManager, FetchOutcome, InstallReport, WorkerError, WorkerState};
use crate::cache::CacheStorage;
use crate::fetch::{Fetcher, Request};

/// Messages a page may post to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
  SkipWaiting,
}

/// Notifications a worker raises to its runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
  SkipWaitingRequested { worker: u64 },
}

#[derive(Debug)]
enum WorkerCommand {
  Install {
    reply: oneshot::Sender<Result<InstallReport, WorkerError>>,
  },
  Activate {
    reply: oneshot::Sender<Result<Vec<String>, WorkerError>>,
  },
  Fetch {
    request: Request,
    reply: oneshot::Sender<FetchOutcome>,
  },
  Message(WorkerMessage),
  Retire,
  State {
    reply: oneshot::Sender<WorkerState>,
  },
}

/// Cheap handle to a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
  id: u64,
  version: String,
  tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub async fn install(&self) -> Result<InstallReport, WorkerError> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerCommand::Install { reply }).await?;
    rx.await.map_err(|_| self.gone())?
  }

  pub async fn activate(&self) -> Result<Vec<String>, WorkerError> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerCommand::Activate { reply }).await?;
    rx.await.map_err(|_| self.gone())?
  }

  /// Ask the worker to handle a request. A stopped worker passes through.
  pub async fn fetch(&self, request: Request) -> FetchOutcome {
    let (reply, rx) = oneshot::channel();
    if self.send(WorkerCommand::Fetch { request, reply }).await.is_err() {
      return FetchOutcome::Passthrough;
    }
    rx.await.unwrap_or(FetchOutcome::Passthrough)
  }

  /// Post a message; returns false if the worker is gone.
  pub async fn post_message(&self, message: WorkerMessage) -> bool {
    self.send(WorkerCommand::Message(message)).await.is_ok()
  }

  pub async fn retire(&self) {
    let _ = self.send(WorkerCommand::Retire).await;
  }

  pub async fn state(&self) -> WorkerState {
    let (reply, rx) = oneshot::channel();
    if self.send(WorkerCommand::State { reply }).await.is_err() {
      return WorkerState::Redundant;
    }
    rx.await.unwrap_or(WorkerState::Redundant)
  }

  async fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
    self.tx.send(command).await.map_err(|_| self.gone())
  }

  fn gone(&self) -> WorkerError {
    WorkerError::Gone(self.version.clone())
  }
}

/// Spawn the actor loop for `manager`.
///
/// The loop ends once every handle is dropped.
pub fn spawn_worker<S, F>(
  mut manager: CacheManager<S, F>,
  id: u64,
  events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  let (tx, mut rx) = mpsc::channel(32);
  let version = manager.version().to_string();

  tokio::spawn(async move {
    while let Some(command) = rx.recv().await {
      match command {
        WorkerCommand::Install { reply } => {
          let _ = reply.send(manager.install().await);
        }
        WorkerCommand::Activate { reply } => {
          let _ = reply.send(manager.activate());
        }
        WorkerCommand::Fetch { request, reply } => {
          // Fetches run concurrently against a snapshot of the lifecycle.
          let snapshot = manager.clone();
          tokio::spawn(async move {
            let _ = reply.send(snapshot.handle_fetch(&request).await);
          });
        }
        WorkerCommand::Message(WorkerMessage::SkipWaiting) => {
          if manager.state() == WorkerState::Waiting {
            if events.send(WorkerEvent::SkipWaitingRequested { worker: id }).is_err() {
              warn!(worker = id, "runtime gone, skip-waiting request dropped");
            }
          } else {
            debug!(worker = id, state = ?manager.state(), "skip-waiting ignored");
          }
        }
        WorkerCommand::Retire => manager.retire(),
        WorkerCommand::State { reply } => {
          let _ = reply.send(manager.state());
        }
      }
    }
    debug!(worker = id, "worker stopped");
  });

  WorkerHandle { id, version, tx }
}
