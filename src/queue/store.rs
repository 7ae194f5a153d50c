//! Queue over an append-only durable log.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{Fields, QueuedSubmission, ReportKind, SubmissionId};
use crate::store::{DurableStore, StoreError};

/// What to do with submissions that carry a binary attachment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentPolicy {
  /// Refuse to queue the submission; the user must resubmit online.
  #[default]
  Refuse,
  /// Queue descriptive metadata only; the bytes are dropped.
  MetadataOnly,
}

#[derive(Debug, Error)]
pub enum QueueError {
  /// The record could not be written durably and lives in memory only.
  #[error("submission {id} is held in memory only and will not survive a restart: {source}")]
  StorageQuota {
    id: SubmissionId,
    #[source]
    source: StoreError,
  },
  #[error("field '{field}' carries an attachment, which cannot be queued while offline")]
  AttachmentRefused { field: String },
  #[error("queue storage failed: {0}")]
  Storage(#[from] StoreError),
  #[error("failed to encode queue record: {0}")]
  Encode(#[from] serde_json::Error),
}

/// One entry of the durable log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogOp {
  Enqueued { item: QueuedSubmission },
  Removed { ids: Vec<SubmissionId> },
  Cleared,
}

#[derive(Debug, Default)]
struct State {
  /// Records that could not be persisted, kept for this process only.
  volatile: Vec<QueuedSubmission>,
  /// Approximate number of records in the durable log.
  log_len: usize,
}

/// Durable FIFO of pending submissions.
///
/// Every operation takes the same lock for its whole read-modify-write, so
/// concurrent callers in one process never interleave. Writes are appends;
/// only [`QueueStore::compact`] rewrites the log, and it reads and rewrites
/// in one store transaction so other processes' appends survive it.
pub struct QueueStore<S: DurableStore> {
  store: S,
  state: Mutex<State>,
  policy: AttachmentPolicy,
  compact_after: usize,
}

impl<S: DurableStore> QueueStore<S> {
  pub fn new(store: S) -> Result<Self, QueueError> {
    let log_len = store.read_log()?.len();
    Ok(Self {
      store,
      state: Mutex::new(State {
        volatile: Vec::new(),
        log_len,
      }),
      policy: AttachmentPolicy::default(),
      compact_after: 64,
    })
  }

  pub fn with_attachment_policy(mut self, policy: AttachmentPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Compact the log once it holds more than `records` entries.
  pub fn with_compaction_threshold(mut self, records: usize) -> Self {
    self.compact_after = records.max(1);
    self
  }

  pub fn attachment_policy(&self) -> AttachmentPolicy {
    self.policy
  }

  /// Queue a new submission and return its idempotency key.
  pub fn enqueue(&self, kind: ReportKind, fields: Fields) -> Result<SubmissionId, QueueError> {
    self.push(QueuedSubmission::new(kind, fields))
  }

  /// Queue an already-built submission, keeping its id.
  ///
  /// Used when a direct delivery attempt failed and the same record has to
  /// be retried later.
  pub fn push(&self, item: QueuedSubmission) -> Result<SubmissionId, QueueError> {
    if let Some(field) = item.first_attachment() {
      match self.policy {
        AttachmentPolicy::Refuse => {
          return Err(QueueError::AttachmentRefused {
            field: field.to_string(),
          });
        }
        AttachmentPolicy::MetadataOnly => {
          warn!(id = %item.id, field, "queueing attachment metadata only, file contents are dropped");
        }
      }
    }

    let id = item.id;
    let kind = item.kind;
    let record = serde_json::to_vec(&LogOp::Enqueued { item: item.clone() })?;

    let mut state = self.lock();
    match self.store.append(&record) {
      Ok(()) => {
        state.log_len += 1;
        info!(%id, %kind, "submission queued");
        self.maybe_compact(&mut state);
        Ok(id)
      }
      Err(source) => {
        warn!(%id, error = %source, "durable queue write failed, keeping submission in memory");
        state.volatile.push(item);
        Err(QueueError::StorageQuota { id, source })
      }
    }
  }

  /// All pending submissions, oldest first.
  pub fn list_pending(&self) -> Result<Vec<QueuedSubmission>, QueueError> {
    let state = self.lock();
    self.pending_locked(&state)
  }

  pub fn pending_count(&self) -> Result<usize, QueueError> {
    self.list_pending().map(|items| items.len())
  }

  /// Remove submissions by id. Unknown ids are ignored.
  pub fn remove(&self, ids: &HashSet<SubmissionId>) -> Result<(), QueueError> {
    if ids.is_empty() {
      return Ok(());
    }

    let mut state = self.lock();
    state.volatile.retain(|item| !ids.contains(&item.id));

    let mut sorted: Vec<SubmissionId> = ids.iter().copied().collect();
    sorted.sort();
    let record = serde_json::to_vec(&LogOp::Removed { ids: sorted })?;
    self.store.append(&record)?;
    state.log_len += 1;
    debug!(count = ids.len(), "submissions removed from queue");

    self.maybe_compact(&mut state);
    Ok(())
  }

  /// Drop every pending submission.
  pub fn clear(&self) -> Result<(), QueueError> {
    let mut state = self.lock();
    state.volatile.clear();
    self.store.append(&serde_json::to_vec(&LogOp::Cleared)?)?;
    state.log_len += 1;
    info!("queue cleared");

    self.compact_locked(&mut state)?;
    Ok(())
  }

  /// Rewrite the durable log to just the live records.
  pub fn compact(&self) -> Result<usize, QueueError> {
    let mut state = self.lock();
    self.compact_locked(&mut state)
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn pending_locked(&self, state: &State) -> Result<Vec<QueuedSubmission>, QueueError> {
    let mut items = replay(&self.store.read_log()?);
    for item in &state.volatile {
      if !items.iter().any(|existing| existing.id == item.id) {
        items.push(item.clone());
      }
    }
    // Stable sort keeps log order for equal timestamps.
    items.sort_by_key(|item| item.enqueued_at);
    Ok(items)
  }

  fn compact_locked(&self, state: &mut State) -> Result<usize, QueueError> {
    let mut encode_error = None;
    let before = state.log_len;
    let after = self.store.rewrite_log(&mut |records: &[Vec<u8>]| {
      let live = replay(records)
        .into_iter()
        .map(|item| serde_json::to_vec(&LogOp::Enqueued { item }))
        .collect::<Result<Vec<_>, _>>();
      match live {
        Ok(live) => live,
        Err(e) => {
          // Leave the log untouched rather than drop an item.
          encode_error = Some(e);
          records.to_vec()
        }
      }
    })?;
    state.log_len = after;

    if let Some(e) = encode_error {
      return Err(e.into());
    }
    debug!(before, after, "queue log compacted");
    Ok(after)
  }

  fn maybe_compact(&self, state: &mut State) {
    if state.log_len <= self.compact_after {
      return;
    }
    if let Err(e) = self.compact_locked(state) {
      warn!(error = %e, "queue compaction failed, log left as is");
    }
  }
}

/// Rebuild the pending list from log records.
///
/// Unreadable records are skipped rather than poisoning the whole queue.
fn replay(records: &[Vec<u8>]) -> Vec<QueuedSubmission> {
  let mut items: Vec<QueuedSubmission> = Vec::new();

  for raw in records {
    let op: LogOp = match serde_json::from_slice(raw) {
      Ok(op) => op,
      Err(e) => {
        warn!(error = %e, "skipping unreadable queue record");
        continue;
      }
    };

    match op {
      LogOp::Enqueued { item } => {
        if !items.iter().any(|existing| existing.id == item.id) {
          items.push(item);
        }
      }
      LogOp::Removed { ids } => {
        let ids: HashSet<SubmissionId> = ids.into_iter().collect();
        items.retain(|item| !ids.contains(&item.id));
      }
      LogOp::Cleared => items.clear(),
    }
  }

  items
}
