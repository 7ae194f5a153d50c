use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, trace};
use url::Url;

/// A source of raw connectivity readings (`true` = online).
#[async_trait]
pub trait NetworkSignal: Send + 'static {
  /// Wait for the next reading. `None` once the source is exhausted.
  async fn next_reading(&mut self) -> Option<bool>;
}

/// Readings pushed by the embedder through a channel.
pub struct ChannelSignal {
  rx: mpsc::UnboundedReceiver<bool>,
}

impl ChannelSignal {
  pub fn new() -> (mpsc::UnboundedSender<bool>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }
}

#[async_trait]
impl NetworkSignal for ChannelSignal {
  async fn next_reading(&mut self) -> Option<bool> {
    self.rx.recv().await
  }
}

/// Polls the backend with a lightweight request.
///
/// Any HTTP response, whatever its status, counts as online; only transport
/// failures (DNS, connect, timeout) count as offline.
pub struct ProbeSignal {
  client: reqwest::Client,
  url: Url,
  ticks: Interval,
}

impl ProbeSignal {
  pub fn new(url: Url, every: Duration, timeout: Duration) -> reqwest::Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let mut ticks = interval(every.max(Duration::from_secs(1)));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Ok(Self { client, url, ticks })
  }
}

#[async_trait]
impl NetworkSignal for ProbeSignal {
  async fn next_reading(&mut self) -> Option<bool> {
    self.ticks.tick().await;
    let online = match self.client.head(self.url.clone()).send().await {
      Ok(response) => {
        trace!(status = %response.status(), "probe answered");
        true
      }
      Err(e) => {
        debug!(error = %e, url = %self.url, "probe failed");
        false
      }
    };
    Some(online)
  }
}
