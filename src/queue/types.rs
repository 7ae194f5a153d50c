//! Submission records held by the offline queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Client-generated idempotency key.
///
/// Created once when a submission is first built and reused verbatim on every
/// delivery attempt, so the backend can recognise a retry as the same report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for SubmissionId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for SubmissionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

impl FromStr for SubmissionId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Uuid::parse_str(s).map(Self)
  }
}

/// Which report form produced a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
  Lost,
  Found,
}

impl fmt::Display for ReportKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReportKind::Lost => f.write_str("lost"),
      ReportKind::Found => f.write_str("found"),
    }
  }
}

impl FromStr for ReportKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "lost" => Ok(ReportKind::Lost),
      "found" => Ok(ReportKind::Found),
      other => Err(format!("unknown report kind '{}' (expected lost or found)", other)),
    }
  }
}

/// Descriptive metadata of a binary attachment.
///
/// Live file contents are never persisted in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
  pub name: String,
  pub mime_type: String,
  pub size: u64,
}

/// Value of a single form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  Text(String),
  Attachment(AttachmentMeta),
}

impl FieldValue {
  pub fn is_attachment(&self) -> bool {
    matches!(self, FieldValue::Attachment(_))
  }
}

impl From<&str> for FieldValue {
  fn from(value: &str) -> Self {
    FieldValue::Text(value.to_string())
  }
}

impl From<String> for FieldValue {
  fn from(value: String) -> Self {
    FieldValue::Text(value)
  }
}

/// Ordered `(name, value)` pairs, serialized as `[[name, value], ...]`.
pub type Fields = Vec<(String, FieldValue)>;

/// A report waiting to be delivered. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedSubmission {
  pub id: SubmissionId,
  pub kind: ReportKind,
  pub fields: Fields,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedSubmission {
  /// Build a new submission with a fresh idempotency key.
  pub fn new(kind: ReportKind, fields: Fields) -> Self {
    Self {
      id: SubmissionId::new(),
      kind,
      fields,
      enqueued_at: Utc::now(),
    }
  }

  /// Name of the first field carrying an attachment, if any.
  pub fn first_attachment(&self) -> Option<&str> {
    self
      .fields
      .iter()
      .find(|(_, value)| value.is_attachment())
      .map(|(name, _)| name.as_str())
  }

  /// Text value of a field, used for log lines and status output.
  pub fn text_field(&self, name: &str) -> Option<&str> {
    self.fields.iter().find_map(|(n, value)| match value {
      FieldValue::Text(text) if n == name => Some(text.as_str()),
      _ => None,
    })
  }
}
