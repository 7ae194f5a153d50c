//! Delivery of queued submissions.
//!
//! - [`FlushOrchestrator`] drains the queue in batches and joins concurrent
//!   flushes into one attempt
//! - [`SyncAgent`] decides when to flush: on reconnect, on demand, and on a
//!   backoff timer
//! - [`HttpTransport`] speaks the `/offline-submit` wire format

mod agent;
mod orchestrator;
mod transport;

pub use agent::{FlushTrigger, PeriodicSchedule, SyncAgent};
pub use orchestrator::{
  FailedSubmission, FlushOrchestrator, FlushReport, FlushSettings, SubmitOutcome, SyncNotice,
};
pub use transport::{BatchOutcome, HttpTransport, ItemOutcome, SubmissionTransport, TransportError};
