//! Request and response snapshots seen by the fetch interceptor.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Whether the request loads a top-level page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  Other,
}

/// What the response will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Manifest,
  Empty,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub url: Url,
  pub method: Method,
  pub mode: RequestMode,
  pub destination: Destination,
  pub accept: Option<String>,
}

impl Request {
  /// A plain GET, as issued by `fetch()` for data or assets.
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: Method::GET,
      mode: RequestMode::Other,
      destination: Destination::Empty,
      accept: None,
    }
  }

  /// A top-level page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      url,
      method: Method::GET,
      mode: RequestMode::Navigate,
      destination: Destination::Document,
      accept: Some("text/html,application/xhtml+xml".to_string()),
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_accept(mut self, accept: &str) -> Self {
    self.accept = Some(accept.to_string());
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
      || self
        .accept
        .as_deref()
        .is_some_and(|accept| accept.contains("text/html"))
  }

  pub fn is_image(&self) -> bool {
    self.destination == Destination::Image
      || self
        .accept
        .as_deref()
        .is_some_and(|accept| accept.starts_with("image/"))
  }

  /// Cache key: the URL without its fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

const OFFLINE_PAGE: &str = "<!doctype html><title>Offline</title><h1>Offline</h1>";

impl Response {
  pub fn new(status: u16, status_text: &str, content_type: Option<&str>, body: Vec<u8>) -> Self {
    Self {
      status,
      status_text: status_text.to_string(),
      headers: content_type
        .map(|ct| vec![("content-type".to_string(), ct.to_string())])
        .unwrap_or_default(),
      body,
    }
  }

  /// Minimal page served when neither network nor cache can answer a
  /// navigation.
  pub fn offline_page() -> Self {
    Self::new(200, "OK", Some("text/html"), OFFLINE_PAGE.as_bytes().to_vec())
  }

  /// Empty image keeping layouts stable while offline.
  pub fn image_placeholder() -> Self {
    Self::new(200, "OK", Some("image/png"), Vec::new())
  }

  /// Explicit offline status for everything else.
  pub fn offline_status() -> Self {
    Self::new(504, "Offline", None, Vec::new())
  }

  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
}

/// Performs real network fetches.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> reqwest::Result<Self> {
    let client = reqwest::Client::builder().build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    if let Some(accept) = &request.accept {
      builder = builder.header(ACCEPT, accept);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|value| (name.as_str().to_string(), value.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?
      .to_vec();

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body,
    })
  }
}
