//! Delivery of submission batches to the backend.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::queue::{FieldValue, QueuedSubmission, ReportKind, SubmissionId};

/// Per-item verdict returned by the submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ItemOutcome {
  Accepted,
  Rejected {
    #[serde(default)]
    reason: String,
  },
}

/// Outcomes keyed by idempotency key. A missing id means "unknown, retry".
pub type BatchOutcome = HashMap<SubmissionId, ItemOutcome>;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("network unreachable: {0}")]
  Network(String),
  #[error("backend returned {status}: {body}")]
  Status { status: u16, body: String },
  #[error("malformed backend response: {0}")]
  Decode(String),
}

impl TransportError {
  /// Whether the failure is expected to clear up on its own.
  ///
  /// Everything leaves the batch queued either way; this only decides how
  /// loudly the failure is logged.
  pub fn is_transient(&self) -> bool {
    match self {
      TransportError::Network(_) => true,
      TransportError::Status { status, .. } => {
        *status >= 500
          || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
          || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
      }
      TransportError::Decode(_) => false,
    }
  }
}

/// Sends a batch of submissions and reports a per-item outcome.
#[async_trait]
pub trait SubmissionTransport: Send + Sync + 'static {
  async fn submit(&self, batch: &[QueuedSubmission]) -> Result<BatchOutcome, TransportError>;
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitRequest<'a> {
  pub items: Vec<WireItem<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireItem<'a> {
  pub id: SubmissionId,
  pub kind: ReportKind,
  pub fields: &'a [(String, FieldValue)],
}

impl<'a> SubmitRequest<'a> {
  pub fn new(batch: &'a [QueuedSubmission]) -> Self {
    Self {
      items: batch
        .iter()
        .map(|item| WireItem {
          id: item.id,
          kind: item.kind,
          fields: &item.fields,
        })
        .collect(),
    }
  }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SubmitResponse {
  #[serde(default)]
  pub results: HashMap<SubmissionId, ItemOutcome>,
}

/// JSON-over-HTTP transport for `POST /offline-submit`.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  endpoint: Url,
}

impl HttpTransport {
  pub fn new(base_url: &Url, timeout: Duration) -> color_eyre::Result<Self> {
    let endpoint = base_url.join("offline-submit")?;
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, endpoint })
  }
}

#[async_trait]
impl SubmissionTransport for HttpTransport {
  async fn submit(&self, batch: &[QueuedSubmission]) -> Result<BatchOutcome, TransportError> {
    debug!(endpoint = %self.endpoint, items = batch.len(), "posting batch");

    let response = self
      .client
      .post(self.endpoint.clone())
      .json(&SubmitRequest::new(batch))
      .send()
      .await
      .map_err(|e| TransportError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(TransportError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| TransportError::Network(e.to_string()))?;
    let parsed: SubmitResponse =
      serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))?;

    Ok(parsed.results)
  }
}
