//! Durable queue of submissions waiting for delivery.

mod store;
mod types;

pub use store::{AttachmentPolicy, QueueError, QueueStore};
pub use types::{AttachmentMeta, FieldValue, Fields, QueuedSubmission, ReportKind, SubmissionId};
