use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::commands::{self, Orchestrator};
use crate::config::Config;
use crate::event::{Event, EventHandler, Input};
use crate::fetch::HttpFetcher;
use crate::network::{NetworkMonitor, NetworkState, ProbeSignal};
use crate::sync::{FlushTrigger, SyncAgent, SyncNotice};
use crate::update::{spawn_runtime, Reloader, RegisterOutcome, RuntimeHandle, UpdateCoordinator, UpdatePrompt};

/// Asks on the console; answers arrive as `y`/`n` lines from the main loop.
struct ConsolePrompt {
  auto_accept: bool,
  answers: Mutex<mpsc::UnboundedReceiver<bool>>,
}

#[async_trait]
impl UpdatePrompt for ConsolePrompt {
  async fn offer(&self, version: &str) -> bool {
    if self.auto_accept {
      println!("update {} is ready, switching", version);
      return true;
    }
    let mut answers = self.answers.lock().await;
    let stale = discard_pending(&mut answers);
    if stale > 0 {
      debug!(stale, "ignoring answers typed before the prompt");
    }
    println!("update {} is ready. Switch now? [y/n]", version);
    answers.recv().await.unwrap_or(false)
  }
}

/// Drop answers that arrived while no prompt was open.
fn discard_pending(answers: &mut mpsc::UnboundedReceiver<bool>) -> usize {
  let mut dropped = 0;
  while answers.try_recv().is_ok() {
    dropped += 1;
  }
  dropped
}

struct ConsoleReloader;

impl Reloader for ConsoleReloader {
  fn reload(&self) {
    println!("new version in control; cached pages are now served by it");
  }
}

/// The long-lived agent behind `fieldsync run`.
pub struct App {
  config: Config,
  orchestrator: Orchestrator,
  monitor: NetworkMonitor,
  runtime: RuntimeHandle<HttpFetcher>,
  answers: mpsc::UnboundedSender<bool>,
  prompt: Option<ConsolePrompt>,
  last_pending: usize,
  should_quit: bool,
}

impl App {
  pub fn new(config: Config, ephemeral: bool) -> Result<Self> {
    let queue = commands::open_queue(&config, ephemeral)?;
    let orchestrator = commands::open_orchestrator(&config, queue)?;
    let monitor = NetworkMonitor::new(NetworkState::Offline, config.debounce());
    let runtime = spawn_runtime(
      commands::open_cache_storage(&config, ephemeral)?,
      Arc::new(HttpFetcher::new()?),
      config.fetch_timeout(),
    );
    let (answers, prompt_answers) = mpsc::unbounded_channel();
    let prompt = ConsolePrompt {
      auto_accept: config.cache.auto_update,
      answers: Mutex::new(prompt_answers),
    };
    let last_pending = *orchestrator.pending().borrow();

    Ok(Self {
      config,
      orchestrator,
      monitor,
      runtime,
      answers,
      prompt: Some(prompt),
      last_pending,
      should_quit: false,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    let prompt = self.prompt.take().ok_or_else(|| eyre!("agent already ran"))?;
    let probe = ProbeSignal::new(
      self.config.backend_url()?,
      self.config.probe_interval(),
      self.config.request_timeout(),
    )?;
    let monitor_task = self.monitor.drive(probe);

    let agent = SyncAgent::new(
      self.orchestrator.clone(),
      self.monitor.clone(),
      self.config.schedule(),
    );
    let triggers = agent.triggers();
    let (stop, stopped) = oneshot::channel::<()>();
    let agent_task = tokio::spawn(agent.run(async {
      let _ = stopped.await;
    }));

    let coordinator = UpdateCoordinator::new(prompt, ConsoleReloader);
    let coordinator_task = tokio::spawn(coordinator.run(self.runtime.subscribe()));

    self.register(self.config.cache.version.clone());

    println!(
      "fieldsync running: {} pending. Commands: flush, status, update <version>, quit",
      self.last_pending
    );

    let mut notices = self.orchestrator.notices();
    let mut events = EventHandler::new(Duration::from_secs(2));

    while !self.should_quit {
      tokio::select! {
        event = events.next() => match event {
          Some(event) => self.handle_event(event, &triggers),
          None => break,
        },
        notice = notices.recv() => match notice {
          Ok(notice) => self.show_notice(notice),
          Err(RecvError::Lagged(_)) => {}
          Err(RecvError::Closed) => break,
        },
        _ = tokio::signal::ctrl_c() => break,
      }
    }

    let _ = stop.send(());
    if let Err(e) = agent_task.await {
      warn!(error = %e, "sync agent ended abnormally");
    }
    monitor_task.abort();
    coordinator_task.abort();
    info!("agent stopped");
    Ok(())
  }

  fn handle_event(&mut self, event: Event, triggers: &mpsc::UnboundedSender<FlushTrigger>) {
    match event {
      Event::Input(Input::Flush) => {
        let _ = triggers.send(FlushTrigger::Manual);
      }
      Event::Input(Input::Status) => self.show_status(),
      Event::Input(Input::Update(version)) => self.register(version),
      Event::Input(Input::Answer(accept)) => {
        let _ = self.answers.send(accept);
      }
      Event::Input(Input::Quit) | Event::Eof => self.should_quit = true,
      Event::Input(Input::Unknown(line)) => println!("unknown command '{}'", line),
      Event::Tick => self.refresh_pending(),
    }
  }

  /// Install a cache version in the background; an update surfaces as a
  /// prompt once it is waiting.
  fn register(&self, version: String) {
    let mut settings = match self.config.worker_settings() {
      Ok(settings) => settings,
      Err(e) => {
        warn!(error = %e, "cannot build cache manager settings");
        return;
      }
    };
    settings.version.version = version;

    let runtime = self.runtime.clone();
    tokio::spawn(async move {
      let version = settings.version.to_string();
      match runtime.register(settings).await {
        Ok(RegisterOutcome::Activated) => info!(%version, "cache manager active"),
        Ok(RegisterOutcome::Waiting) => info!(%version, "cache manager waiting"),
        Err(e) => {
          warn!(%version, error = %e, "cache manager install failed");
          println!("could not install cache {}: {}", version, e);
        }
      }
    });
  }

  /// Pick up enqueues made by other processes sharing the database.
  fn refresh_pending(&mut self) {
    self.orchestrator.refresh_pending();
    let pending = *self.orchestrator.pending().borrow();
    if pending != self.last_pending {
      println!("{} pending", pending);
      self.last_pending = pending;
    }
  }

  fn show_status(&mut self) {
    self.refresh_pending();
    println!(
      "{}, {} pending, cache {}",
      self.monitor.state(),
      self.last_pending,
      self
        .runtime
        .controller_version()
        .unwrap_or_else(|| "not installed".to_string())
    );
  }

  fn show_notice(&mut self, notice: SyncNotice) {
    match notice {
      SyncNotice::Synced { count } => println!("synced {} report(s)", count),
      SyncNotice::Rejected { failures } => {
        for failure in failures {
          println!("report {} was rejected: {}", failure.id, failure.reason);
        }
      }
      SyncNotice::RetryLater { pending } => {
        println!("sync incomplete, {} report(s) will be retried", pending)
      }
    }
    self.refresh_pending();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_answer_typed_before_prompt_is_ignored() {
    let (tx, rx) = mpsc::unbounded_channel();
    let prompt = ConsolePrompt {
      auto_accept: false,
      answers: Mutex::new(rx),
    };

    // A stray "y" with nothing to answer.
    tx.send(true).unwrap();

    let offer = prompt.offer("v2");
    tokio::pin!(offer);
    assert!(futures::poll!(offer.as_mut()).is_pending());

    tx.send(false).unwrap();
    assert!(!offer.await);
  }

  #[tokio::test]
  async fn test_auto_accept_skips_question() {
    let (_tx, rx) = mpsc::unbounded_channel();
    let prompt = ConsolePrompt {
      auto_accept: true,
      answers: Mutex::new(rx),
    };
    assert!(prompt.offer("v2").await);
  }
}
