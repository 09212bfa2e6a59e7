//! Network seam and its reqwest-backed implementation.

use futures::future::BoxFuture;
use std::time::Duration;
use tracing::debug;

use crate::http::{FetchError, Method, Request, Response};

/// Anything that can turn a request into a response over the network.
pub trait Network: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, FetchError>>;
}

/// Fetch with an explicit bounded wait.
pub async fn fetch_with_timeout(
  network: &dyn Network,
  request: Request,
  timeout: Duration,
) -> Result<Response, FetchError> {
  match tokio::time::timeout(timeout, network.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(FetchError::Timeout(timeout)),
  }
}

/// HTTP client wrapper
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offline-runtime/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn send(&self, request: Request) -> Result<Response, FetchError> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Head => reqwest::Method::HEAD,
      Method::Options => reqwest::Method::OPTIONS,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(key) = &request.idempotency_key {
      builder = builder.header("Idempotency-Key", key.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder.send().await.map_err(classify)?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(classify)?.to_vec();

    debug!(url = %request.url, status, "network response");
    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, FetchError>> {
    Box::pin(self.send(request))
  }
}

fn classify(error: reqwest::Error) -> FetchError {
  if error.is_timeout() {
    FetchError::Timeout(Duration::ZERO)
  } else if error.is_connect() {
    FetchError::Offline(error.to_string())
  } else {
    FetchError::Transport(error.to_string())
  }
}
