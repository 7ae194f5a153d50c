//! Shared fakes for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::fetch::{FetchError, Fetcher, Request, Response};

/// Scriptable network keyed by URL path.
///
/// Unknown paths answer 404; when offline every request fails.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  hits: Mutex<HashMap<String, usize>>,
  offline: AtomicBool,
  latency: Mutex<Option<Duration>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn serve(&self, path: &str, content_type: &str, body: &str) {
    self.respond(
      path,
      Response::new(200, "OK", Some(content_type), body.as_bytes().to_vec()),
    );
  }

  pub fn respond(&self, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = Some(latency);
  }

  pub fn hits(&self, path: &str) -> usize {
    self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
  }
}

#[async_trait]
impl Fetcher for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let latency = *self.latency.lock().unwrap();
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    let path = request.url.path().to_string();
    *self.hits.lock().unwrap().entry(path.clone()).or_default() += 1;

    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Network("connection refused".to_string()));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "Not Found", None, Vec::new())),
    )
  }
}
