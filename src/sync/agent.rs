//! Event-driven flush scheduling.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use super::orchestrator::{FlushOrchestrator, FlushReport};
use super::transport::SubmissionTransport;
use crate::network::{NetworkMonitor, Subscription};
use crate::store::DurableStore;

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
  /// The monitor settled on "online".
  BecameOnline,
  /// The user asked to send pending reports now.
  Manual,
  /// Safety-net timer.
  Periodic,
}

/// Shortest safety-net interval; a zero interval would flush in a tight loop.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Safety-net timer with exponential backoff.
///
/// The delay doubles after every flush that left items behind and snaps back
/// to the base interval after a clean one.
#[derive(Debug, Clone)]
pub struct PeriodicSchedule {
  base: Duration,
  max: Duration,
  current: Duration,
}

impl PeriodicSchedule {
  pub fn new(base: Duration, max: Duration) -> Self {
    let base = base.max(MIN_INTERVAL);
    let max = max.max(base);
    Self {
      base,
      max,
      current: base,
    }
  }

  pub fn delay(&self) -> Duration {
    self.current
  }

  pub fn record(&mut self, report: &FlushReport) {
    self.current = if report.is_clean() {
      self.base
    } else {
      self.current.saturating_mul(2).min(self.max)
    };
  }
}

/// Runs flushes in response to triggers.
pub struct SyncAgent<S: DurableStore, T> {
  orchestrator: FlushOrchestrator<S, T>,
  monitor: NetworkMonitor,
  schedule: PeriodicSchedule,
  tx: mpsc::UnboundedSender<FlushTrigger>,
  rx: mpsc::UnboundedReceiver<FlushTrigger>,
}

impl<S, T> SyncAgent<S, T>
where
  S: DurableStore + 'static,
  T: SubmissionTransport,
{
  pub fn new(
    orchestrator: FlushOrchestrator<S, T>,
    monitor: NetworkMonitor,
    schedule: PeriodicSchedule,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      orchestrator,
      monitor,
      schedule,
      tx,
      rx,
    }
  }

  /// Sender for manual triggers (the "send now" affordance).
  pub fn triggers(&self) -> mpsc::UnboundedSender<FlushTrigger> {
    self.tx.clone()
  }

  /// Process triggers until `shutdown` resolves.
  pub async fn run<F>(mut self, shutdown: F)
  where
    F: Future<Output = ()>,
  {
    let _online = self.forward_online_events();
    tokio::pin!(shutdown);

    loop {
      let delay = self.schedule.delay();
      let trigger = tokio::select! {
        _ = &mut shutdown => break,
        trigger = self.rx.recv() => match trigger {
          Some(trigger) => trigger,
          None => break,
        },
        _ = sleep(delay) => {
          if !self.monitor.is_online() {
            debug!("periodic flush skipped while offline");
            continue;
          }
          FlushTrigger::Periodic
        }
      };

      info!(?trigger, "flushing offline queue");
      let report = self.orchestrator.flush().await;
      self.schedule.record(&report);
    }

    debug!("sync agent stopped");
  }

  fn forward_online_events(&self) -> Subscription {
    let tx = self.tx.clone();
    self.monitor.on_change(move |state| {
      if state.is_online() {
        let _ = tx.send(FlushTrigger::BecameOnline);
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::{ChannelSignal, NetworkState};
  use crate::queue::{QueueStore, QueuedSubmission, ReportKind, SubmissionId};
  use crate::store::MemoryStore;
  use crate::sync::orchestrator::FlushSettings;
  use crate::sync::transport::{BatchOutcome, ItemOutcome, TransportError};
  use async_trait::async_trait;
  use std::collections::HashMap;
  use std::sync::{Arc, Mutex};

  #[derive(Default)]
  struct Recorder {
    batches: Mutex<Vec<Vec<SubmissionId>>>,
  }

  #[async_trait]
  impl SubmissionTransport for Arc<Recorder> {
    async fn submit(&self, batch: &[QueuedSubmission]) -> Result<BatchOutcome, TransportError> {
      self
        .batches
        .lock()
        .unwrap()
        .push(batch.iter().map(|item| item.id).collect());
      Ok(
        batch
          .iter()
          .map(|item| (item.id, ItemOutcome::Accepted))
          .collect::<HashMap<_, _>>(),
      )
    }
  }

  #[test]
  fn test_backoff_doubles_and_resets() {
    let mut schedule = PeriodicSchedule::new(Duration::from_secs(60), Duration::from_secs(300));
    let dirty = FlushReport {
      deferred: 1,
      ..Default::default()
    };

    schedule.record(&dirty);
    assert_eq!(schedule.delay(), Duration::from_secs(120));
    schedule.record(&dirty);
    schedule.record(&dirty);
    assert_eq!(schedule.delay(), Duration::from_secs(300));

    schedule.record(&FlushReport::default());
    assert_eq!(schedule.delay(), Duration::from_secs(60));
  }

  #[test]
  fn test_zero_interval_is_clamped() {
    let mut schedule = PeriodicSchedule::new(Duration::ZERO, Duration::ZERO);
    assert_eq!(schedule.delay(), Duration::from_secs(1));

    let dirty = FlushReport {
      deferred: 1,
      ..Default::default()
    };
    schedule.record(&dirty);
    assert_eq!(schedule.delay(), Duration::from_secs(1));
  }

  #[test]
  fn test_huge_cap_does_not_overflow() {
    let mut schedule = PeriodicSchedule::new(Duration::from_secs(u64::MAX / 2 + 1), Duration::MAX);
    let dirty = FlushReport {
      deferred: 1,
      ..Default::default()
    };
    schedule.record(&dirty);
    schedule.record(&dirty);
    assert_eq!(schedule.delay(), Duration::MAX);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_queue_flushes_when_back_online() {
    let backend = Arc::new(Recorder::default());
    let queue = Arc::new(QueueStore::new(MemoryStore::new()).unwrap());
    let sync = FlushOrchestrator::new(Arc::clone(&queue), Arc::clone(&backend), FlushSettings::default());
    let pending = sync.pending();

    let monitor = NetworkMonitor::new(NetworkState::Offline, Duration::from_millis(200));
    let (signal_tx, signal) = ChannelSignal::new();
    monitor.drive(signal);

    let a = sync
      .submit(ReportKind::Lost, vec![("title".to_string(), "A".into())], monitor.is_online())
      .await
      .unwrap();
    let b = sync
      .submit(ReportKind::Found, vec![("title".to_string(), "B".into())], monitor.is_online())
      .await
      .unwrap();
    assert_eq!(*pending.borrow(), 2);
    assert!(backend.batches.lock().unwrap().is_empty());

    let agent = SyncAgent::new(
      sync.clone(),
      monitor.clone(),
      PeriodicSchedule::new(Duration::from_secs(3600), Duration::from_secs(3600)),
    );
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(agent.run(async move {
      let _ = stop_rx.await;
    }));

    signal_tx.send(true).unwrap();
    sleep(Duration::from_secs(1)).await;

    let batches = backend.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1, "both items go out in a single batch");
    let expected: Vec<SubmissionId> = [a, b]
      .into_iter()
      .map(|outcome| match outcome {
        crate::sync::SubmitOutcome::Queued(id) => id,
        other => panic!("unexpected outcome: {:?}", other),
      })
      .collect();
    assert_eq!(batches[0], expected);
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert_eq!(*pending.borrow(), 0);

    let _ = stop_tx.send(());
    task.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_manual_trigger_flushes() {
    let backend = Arc::new(Recorder::default());
    let queue = Arc::new(QueueStore::new(MemoryStore::new()).unwrap());
    let sync = FlushOrchestrator::new(Arc::clone(&queue), Arc::clone(&backend), FlushSettings::default());
    queue
      .enqueue(ReportKind::Lost, vec![("title".to_string(), "A".into())])
      .unwrap();

    let monitor = NetworkMonitor::new(NetworkState::Online, Duration::from_millis(200));
    let agent = SyncAgent::new(
      sync,
      monitor,
      PeriodicSchedule::new(Duration::from_secs(3600), Duration::from_secs(3600)),
    );
    let triggers = agent.triggers();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(agent.run(async move {
      let _ = stop_rx.await;
    }));

    triggers.send(FlushTrigger::Manual).unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.batches.lock().unwrap().len(), 1);

    let _ = stop_tx.send(());
    task.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_timer_skips_while_offline() {
    let backend = Arc::new(Recorder::default());
    let queue = Arc::new(QueueStore::new(MemoryStore::new()).unwrap());
    let sync = FlushOrchestrator::new(Arc::clone(&queue), Arc::clone(&backend), FlushSettings::default());
    queue
      .enqueue(ReportKind::Lost, vec![("title".to_string(), "A".into())])
      .unwrap();

    let monitor = NetworkMonitor::new(NetworkState::Offline, Duration::from_millis(200));
    let agent = SyncAgent::new(
      sync,
      monitor,
      PeriodicSchedule::new(Duration::from_secs(5), Duration::from_secs(60)),
    );
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(agent.run(async move {
      let _ = stop_rx.await;
    }));

    sleep(Duration::from_secs(30)).await;
    assert!(backend.batches.lock().unwrap().is_empty());

    let _ = stop_tx.send(());
    task.await.unwrap();
  }
}
