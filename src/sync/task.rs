//! Sync task records.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use crate::http::{Method, Request};

/// Lifecycle of a queued mutation. `done` tasks are removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
  Pending,
  InFlight,
  Failed,
  Done,
}

impl TaskStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in-flight",
      Self::Failed => "failed",
      Self::Done => "done",
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "in-flight" => Ok(Self::InFlight),
      "failed" => Ok(Self::Failed),
      "done" => Ok(Self::Done),
      other => Err(format!("unknown task status: {}", other)),
    }
  }
}

/// A durably queued mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
  pub id: i64,
  /// Logical resource; tasks for the same resource never overtake each other
  pub resource: String,
  pub endpoint: String,
  pub method: Method,
  pub headers: Vec<(String, String)>,
  pub payload: Option<Vec<u8>>,
  pub idempotency_key: String,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub status: TaskStatus,
  pub next_attempt_at: DateTime<Utc>,
  pub last_error: Option<String>,
}

impl SyncTask {
  /// Rebuild the request for replay. The idempotency key travels with every attempt.
  pub fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.endpoint)
      .map_err(|e| eyre!("Task {} has an invalid endpoint {}: {}", self.id, self.endpoint, e))?;

    Ok(Request {
      method: self.method,
      url,
      headers: self.headers.clone(),
      body: self.payload.clone(),
      mode: Default::default(),
      resource: Some(self.resource.clone()),
      idempotency_key: Some(self.idempotency_key.clone()),
    })
  }
}

static KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Client-side idempotency key for a mutation that did not bring its own.
///
/// Assigned before the first network attempt so that attempt and every replay share it.
pub fn new_idempotency_key(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(request.url.as_str().as_bytes());
  if let Some(body) = &request.body {
    hasher.update(body);
  }
  hasher.update(
    Utc::now()
      .timestamp_nanos_opt()
      .unwrap_or_default()
      .to_be_bytes(),
  );
  hasher.update(KEY_COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
  hex::encode(&hasher.finalize()[..16])
}
