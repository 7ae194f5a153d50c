//! Page side of an update: prompt once, hand over, reload once.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::runtime::ClientEvent;
use crate::worker::WorkerMessage;

/// Asks the user whether to switch to a waiting version.
#[async_trait]
pub trait UpdatePrompt: Send + Sync {
  async fn offer(&self, version: &str) -> bool;
}

/// Reloads the page so it runs under the new controller.
pub trait Reloader: Send + Sync {
  fn reload(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction {
  /// The user accepted and the waiting worker was told to skip waiting.
  Accepted { version: String },
  Declined { version: String },
  /// This version was offered before.
  AlreadyOffered { version: String },
  Reloaded,
  /// A later controller change after the single reload.
  Ignored,
}

pub struct UpdateCoordinator<P: UpdatePrompt, R: Reloader> {
  prompt: P,
  reloader: R,
  offered: HashSet<String>,
  reloaded: bool,
}

impl<P: UpdatePrompt, R: Reloader> UpdateCoordinator<P, R> {
  pub fn new(prompt: P, reloader: R) -> Self {
    Self {
      prompt,
      reloader,
      offered: HashSet::new(),
      reloaded: false,
    }
  }

  pub async fn handle(&mut self, event: ClientEvent) -> UpdateAction {
    match event {
      ClientEvent::UpdateWaiting { version, worker } => {
        if !self.offered.insert(version.clone()) {
          return UpdateAction::AlreadyOffered { version };
        }
        if !self.prompt.offer(&version).await {
          info!(%version, "update declined");
          return UpdateAction::Declined { version };
        }
        if !worker.post_message(WorkerMessage::SkipWaiting).await {
          warn!(%version, "waiting worker is gone");
        }
        UpdateAction::Accepted { version }
      }
      ClientEvent::ControllerChange { version } => {
        if self.reloaded {
          debug!(%version, "already reloaded once");
          return UpdateAction::Ignored;
        }
        self.reloaded = true;
        info!(%version, "new version in control, reloading");
        self.reloader.reload();
        UpdateAction::Reloaded
      }
    }
  }

  /// Consume runtime events until the runtime goes away.
  pub async fn run(mut self, mut events: broadcast::Receiver<ClientEvent>) {
    loop {
      match events.recv().await {
        Ok(event) => {
          self.handle(event).await;
        }
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed update events"),
        Err(RecvError::Closed) => break,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheVersion, MemoryCacheStorage};
  use crate::test_support::FakeNetwork;
  use crate::update::{spawn_runtime, RegisterOutcome};
  use crate::worker::{Manifest, WorkerSettings};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;
  use url::Url;

  struct Answer {
    accept: bool,
    asked: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl UpdatePrompt for Answer {
    async fn offer(&self, _version: &str) -> bool {
      self.asked.fetch_add(1, Ordering::SeqCst);
      self.accept
    }
  }

  #[derive(Clone, Default)]
  struct CountingReloader(Arc<AtomicUsize>);

  impl Reloader for CountingReloader {
    fn reload(&self) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn coordinator(
    accept: bool,
  ) -> (UpdateCoordinator<Answer, CountingReloader>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let asked = Arc::new(AtomicUsize::new(0));
    let reloader = CountingReloader::default();
    let reloads = Arc::clone(&reloader.0);
    let prompt = Answer {
      accept,
      asked: Arc::clone(&asked),
    };
    (UpdateCoordinator::new(prompt, reloader), asked, reloads)
  }

  #[tokio::test]
  async fn test_two_controller_changes_reload_once() {
    let (mut coordinator, _, reloads) = coordinator(true);

    let first = coordinator
      .handle(ClientEvent::ControllerChange { version: "v2".to_string() })
      .await;
    let second = coordinator
      .handle(ClientEvent::ControllerChange { version: "v3".to_string() })
      .await;

    assert_eq!(first, UpdateAction::Reloaded);
    assert_eq!(second, UpdateAction::Ignored);
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
  }

  fn settings(version: &str) -> WorkerSettings {
    WorkerSettings {
      origin: Url::parse("https://loft.example").unwrap(),
      version: CacheVersion::new(version),
      manifest: Manifest::default(),
    }
  }

  fn network() -> Arc<FakeNetwork> {
    let network = Arc::new(FakeNetwork::new());
    network.serve("/", "text/html", "shell");
    network.serve("/manifest.webmanifest", "application/manifest+json", "{}");
    network
  }

  #[tokio::test]
  async fn test_accepted_update_hands_over_and_reloads() {
    let runtime = spawn_runtime(Arc::new(MemoryCacheStorage::new()), network(), Duration::from_secs(5));
    runtime.register(settings("v1")).await.unwrap();
    let mut events = runtime.subscribe();
    let (mut coordinator, asked, reloads) = coordinator(true);

    assert_eq!(runtime.register(settings("v2")).await.unwrap(), RegisterOutcome::Waiting);
    let waiting = events.recv().await.unwrap();
    let repeat = waiting.clone();
    assert_eq!(
      coordinator.handle(waiting).await,
      UpdateAction::Accepted { version: "v2".to_string() }
    );
    assert_eq!(
      coordinator.handle(repeat).await,
      UpdateAction::AlreadyOffered { version: "v2".to_string() }
    );

    let change = events.recv().await.unwrap();
    assert_eq!(coordinator.handle(change).await, UpdateAction::Reloaded);
    assert_eq!(runtime.controller_version().as_deref(), Some("v2"));
    assert_eq!(asked.load(Ordering::SeqCst), 1);
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_declined_update_keeps_old_controller() {
    let runtime = spawn_runtime(Arc::new(MemoryCacheStorage::new()), network(), Duration::from_secs(5));
    runtime.register(settings("v1")).await.unwrap();
    let mut events = runtime.subscribe();
    let (mut coordinator, _, reloads) = coordinator(false);

    runtime.register(settings("v2")).await.unwrap();
    let waiting = events.recv().await.unwrap();
    assert_eq!(
      coordinator.handle(waiting).await,
      UpdateAction::Declined { version: "v2".to_string() }
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(runtime.controller_version().as_deref(), Some("v1"));
    assert!(events.try_recv().is_err());
    assert_eq!(reloads.load(Ordering::SeqCst), 0);
  }
}
