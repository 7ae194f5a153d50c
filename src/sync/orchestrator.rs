//! Draining the offline queue to the backend.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::transport::{ItemOutcome, SubmissionTransport};
use crate::queue::{
  AttachmentPolicy, Fields, QueueError, QueueStore, QueuedSubmission, ReportKind, SubmissionId,
};
use crate::store::DurableStore;

/// A submission the backend (or the local pre-check) will never accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSubmission {
  pub id: SubmissionId,
  pub reason: String,
}

/// Result of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  /// Items that were sent or classified locally.
  pub attempted: usize,
  /// Items acknowledged and removed.
  pub succeeded: usize,
  /// Items permanently rejected and removed.
  pub failed: usize,
  /// Items left queued for a later flush.
  pub deferred: usize,
  pub failures: Vec<FailedSubmission>,
}

impl FlushReport {
  pub fn is_clean(&self) -> bool {
    self.deferred == 0
  }
}

/// Transient notification published after a flush that did some work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
  Synced { count: usize },
  Rejected { failures: Vec<FailedSubmission> },
  RetryLater { pending: usize },
}

/// Outcome of a direct (online) submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  Delivered(SubmissionId),
  Queued(SubmissionId),
  Rejected(FailedSubmission),
}

#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
  pub max_batch_size: usize,
}

impl Default for FlushSettings {
  fn default() -> Self {
    Self { max_batch_size: 20 }
  }
}

type InFlight = Shared<BoxFuture<'static, FlushReport>>;

struct Inner<S: DurableStore, T> {
  queue: Arc<QueueStore<S>>,
  transport: T,
  settings: FlushSettings,
  in_flight: Mutex<Option<InFlight>>,
  pending: watch::Sender<usize>,
  notices: broadcast::Sender<SyncNotice>,
}

/// Drains the queue in batches with per-item acknowledgement.
///
/// Concurrent calls to [`FlushOrchestrator::flush`] join the flush that is
/// already running instead of sending the same items twice.
pub struct FlushOrchestrator<S: DurableStore, T> {
  inner: Arc<Inner<S, T>>,
}

impl<S: DurableStore, T> Clone for FlushOrchestrator<S, T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S, T> FlushOrchestrator<S, T>
where
  S: DurableStore + 'static,
  T: SubmissionTransport,
{
  pub fn new(queue: Arc<QueueStore<S>>, transport: T, settings: FlushSettings) -> Self {
    let initial = queue.pending_count().unwrap_or(0);
    let (pending, _) = watch::channel(initial);
    let (notices, _) = broadcast::channel(32);

    Self {
      inner: Arc::new(Inner {
        queue,
        transport,
        settings: FlushSettings {
          max_batch_size: settings.max_batch_size.max(1),
        },
        in_flight: Mutex::new(None),
        pending,
        notices,
      }),
    }
  }

  pub fn queue(&self) -> &Arc<QueueStore<S>> {
    &self.inner.queue
  }

  /// Number of pending submissions, for the persistent indicator.
  pub fn pending(&self) -> watch::Receiver<usize> {
    self.inner.pending.subscribe()
  }

  pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
    self.inner.notices.subscribe()
  }

  /// Re-read the queue size after an out-of-band change such as an enqueue.
  pub fn refresh_pending(&self) {
    self.inner.refresh_pending();
  }

  /// Try to deliver a new report right away, queueing it on failure.
  ///
  /// When `online` is false the network is skipped entirely. The queued
  /// record keeps the id used for the attempt.
  pub async fn submit(
    &self,
    kind: ReportKind,
    fields: Fields,
    online: bool,
  ) -> Result<SubmitOutcome, QueueError> {
    let item = QueuedSubmission::new(kind, fields);

    if online {
      if let Err(reason) = precheck(&item, self.inner.queue.attachment_policy()) {
        return Ok(SubmitOutcome::Rejected(FailedSubmission { id: item.id, reason }));
      }

      match self.inner.transport.submit(std::slice::from_ref(&item)).await {
        Ok(outcomes) => match outcomes.get(&item.id) {
          Some(ItemOutcome::Accepted) => {
            info!(id = %item.id, "submission delivered directly");
            return Ok(SubmitOutcome::Delivered(item.id));
          }
          Some(ItemOutcome::Rejected { reason }) => {
            return Ok(SubmitOutcome::Rejected(FailedSubmission {
              id: item.id,
              reason: reason.clone(),
            }));
          }
          None => debug!(id = %item.id, "backend did not acknowledge submission, queueing"),
        },
        Err(e) if !e.is_transient() => {
          warn!(id = %item.id, error = %e, "backend refused submission");
          return Ok(SubmitOutcome::Rejected(FailedSubmission {
            id: item.id,
            reason: e.to_string(),
          }));
        }
        Err(e) => warn!(id = %item.id, error = %e, "direct submission failed, queueing"),
      }
    }

    let result = self.inner.queue.push(item);
    self.inner.refresh_pending();
    result.map(SubmitOutcome::Queued)
  }

  /// Drain the queue once, or join the drain already in progress.
  pub async fn flush(&self) -> FlushReport {
    let flight = {
      let mut slot = self
        .inner
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

      match slot.as_ref() {
        Some(running) => {
          debug!("flush already in progress, joining it");
          running.clone()
        }
        None => {
          let inner = Arc::clone(&self.inner);
          let flight = async move {
            let report = inner.run_flush().await;
            inner
              .in_flight
              .lock()
              .unwrap_or_else(PoisonError::into_inner)
              .take();
            report
          }
          .boxed()
          .shared();
          *slot = Some(flight.clone());
          flight
        }
      }
    };

    flight.await
  }
}

impl<S, T> Inner<S, T>
where
  S: DurableStore,
  T: SubmissionTransport,
{
  async fn run_flush(&self) -> FlushReport {
    let snapshot = match self.queue.list_pending() {
      Ok(items) => items,
      Err(e) => {
        error!(error = %e, "could not read the offline queue");
        return FlushReport::default();
      }
    };

    if snapshot.is_empty() {
      self.pending.send_replace(0);
      return FlushReport::default();
    }

    let mut report = FlushReport::default();
    let policy = self.queue.attachment_policy();

    let mut sendable = Vec::with_capacity(snapshot.len());
    let mut invalid = HashSet::new();
    for item in snapshot {
      match precheck(&item, policy) {
        Ok(()) => sendable.push(item),
        Err(reason) => {
          warn!(id = %item.id, %reason, "dropping submission that can never be delivered");
          report.attempted += 1;
          report.failed += 1;
          invalid.insert(item.id);
          report.failures.push(FailedSubmission { id: item.id, reason });
        }
      }
    }
    self.prune(&invalid);

    // A refused batch is split until the offending item is alone, so one
    // bad record never holds back the others.
    let mut work: VecDeque<&[QueuedSubmission]> = sendable.chunks(self.settings.max_batch_size).collect();
    let mut halted = false;
    while let Some(batch) = work.pop_front() {
      if halted {
        report.deferred += batch.len();
        continue;
      }

      match self.transport.submit(batch).await {
        Ok(outcomes) => {
          report.attempted += batch.len();
          let mut settled = HashSet::new();
          for item in batch {
            match outcomes.get(&item.id) {
              Some(ItemOutcome::Accepted) => {
                report.succeeded += 1;
                settled.insert(item.id);
              }
              Some(ItemOutcome::Rejected { reason }) => {
                warn!(id = %item.id, %reason, "backend rejected submission");
                report.failed += 1;
                settled.insert(item.id);
                report.failures.push(FailedSubmission {
                  id: item.id,
                  reason: reason.clone(),
                });
              }
              None => report.deferred += 1,
            }
          }
          self.prune(&settled);
        }
        Err(e) if e.is_transient() => {
          warn!(error = %e, items = batch.len(), "batch delivery failed, will retry");
          report.attempted += batch.len();
          report.deferred += batch.len();
          halted = true;
        }
        Err(e) if batch.len() > 1 => {
          warn!(error = %e, items = batch.len(), "batch refused by backend, splitting");
          let (head, tail) = batch.split_at(batch.len() / 2);
          work.push_front(tail);
          work.push_front(head);
        }
        Err(e) => {
          let item = &batch[0];
          error!(id = %item.id, error = %e, "backend refused submission");
          report.attempted += 1;
          report.failed += 1;
          report.failures.push(FailedSubmission {
            id: item.id,
            reason: e.to_string(),
          });
          self.prune(&HashSet::from([item.id]));
        }
      }
    }

    let pending = self.refresh_pending();
    self.announce(&report, pending);
    info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      failed = report.failed,
      deferred = report.deferred,
      pending,
      "flush finished"
    );
    report
  }

  fn prune(&self, ids: &HashSet<SubmissionId>) {
    if let Err(e) = self.queue.remove(ids) {
      // The items will be sent again; the backend deduplicates by id.
      warn!(error = %e, count = ids.len(), "failed to prune settled submissions");
    }
  }

  fn refresh_pending(&self) -> usize {
    match self.queue.pending_count() {
      Ok(count) => {
        self.pending.send_replace(count);
        count
      }
      Err(e) => {
        warn!(error = %e, "could not count pending submissions");
        *self.pending.borrow()
      }
    }
  }

  fn announce(&self, report: &FlushReport, pending: usize) {
    // Nobody listening is fine.
    if report.succeeded > 0 {
      let _ = self.notices.send(SyncNotice::Synced {
        count: report.succeeded,
      });
    }
    if !report.failures.is_empty() {
      let _ = self.notices.send(SyncNotice::Rejected {
        failures: report.failures.clone(),
      });
    }
    if report.deferred > 0 {
      let _ = self.notices.send(SyncNotice::RetryLater { pending });
    }
  }
}

/// Local validation of a record before it is sent.
fn precheck(item: &QueuedSubmission, policy: AttachmentPolicy) -> Result<(), String> {
  if item.fields.is_empty() {
    return Err("submission has no fields".to_string());
  }
  if item.fields.iter().any(|(name, _)| name.trim().is_empty()) {
    return Err("submission has a field without a name".to_string());
  }
  if policy == AttachmentPolicy::Refuse {
    if let Some(field) = item.first_attachment() {
      return Err(format!("field '{}' carries an attachment that cannot be delivered", field));
    }
  }
  Ok(())
}
