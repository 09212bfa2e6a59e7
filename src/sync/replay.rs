//! Ordered replay of queued mutations.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::queue::SyncQueue;
use super::task::{SyncTask, TaskStatus};
use crate::bridge::{HostBridge, RuntimeMessage};
use crate::config::SyncConfig;
use crate::http::{FetchError, Response};
use crate::network::{fetch_with_timeout, Network};

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
  pub base: Duration,
  pub max: Duration,
}

impl Backoff {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      base: Duration::from_millis(config.base_backoff_ms),
      max: Duration::from_millis(config.max_backoff_ms),
    }
  }

  /// Delay before the attempt following `attempts` failures.
  pub fn delay(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    self
      .base
      .checked_mul(1u32 << exponent)
      .map_or(self.max, |d| d.min(self.max))
  }
}

/// Map from resource to the single task currently delivering to it.
#[derive(Clone, Default)]
pub struct InFlight {
  owners: Arc<Mutex<HashMap<String, i64>>>,
}

impl InFlight {
  /// Take ownership of `resource` for `task_id`. False if another task holds it.
  pub fn try_acquire(&self, resource: &str, task_id: i64) -> bool {
    let Ok(mut owners) = self.owners.lock() else {
      return false;
    };
    match owners.get(resource) {
      Some(owner) => *owner == task_id,
      None => {
        owners.insert(resource.to_string(), task_id);
        true
      }
    }
  }

  pub fn release(&self, resource: &str, task_id: i64) {
    if let Ok(mut owners) = self.owners.lock() {
      if owners.get(resource) == Some(&task_id) {
        owners.remove(resource);
      }
    }
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
  pub delivered: Vec<i64>,
  pub failed: Vec<i64>,
  /// Tasks left for later: backoff pending or blocked behind an earlier task
  pub deferred: usize,
  /// Earliest moment a deferred task becomes eligible again
  pub next_retry_at: Option<DateTime<Utc>>,
}

enum Attempt {
  Delivered,
  Rejected(String),
  Transient(String),
}

/// Walks the queue in id order and delivers what it can.
#[derive(Clone)]
pub struct Replayer {
  queue: SyncQueue,
  network: Arc<dyn Network>,
  bridge: HostBridge,
  in_flight: InFlight,
  timeout: Duration,
  max_attempts: u32,
  backoff: Backoff,
}

impl Replayer {
  pub fn new(
    queue: SyncQueue,
    network: Arc<dyn Network>,
    bridge: HostBridge,
    timeout: Duration,
    config: &SyncConfig,
  ) -> Self {
    Self {
      queue,
      network,
      bridge,
      in_flight: InFlight::default(),
      timeout,
      max_attempts: config.max_attempts.max(1),
      backoff: Backoff::from_config(config),
    }
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  /// One pass over the queue.
  ///
  /// A resource is blocked for the rest of the pass as soon as one of its tasks is failed,
  /// waiting out a backoff, or held by another delivery; later tasks for that resource
  /// wait, unrelated resources proceed.
  pub async fn run_pass(&self) -> Result<PassReport> {
    let mut report = PassReport::default();
    let mut blocked: HashSet<String> = HashSet::new();
    let now = Utc::now();

    for task in self.queue.replayable()? {
      if blocked.contains(&task.resource) {
        report.deferred += 1;
        continue;
      }
      if task.status == TaskStatus::Failed {
        debug!(task_id = task.id, resource = %task.resource, "failed task blocks its resource");
        blocked.insert(task.resource.clone());
        continue;
      }
      if task.next_attempt_at > now {
        report.deferred += 1;
        report.next_retry_at = earliest(report.next_retry_at, task.next_attempt_at);
        blocked.insert(task.resource.clone());
        continue;
      }
      if !self.in_flight.try_acquire(&task.resource, task.id) {
        report.deferred += 1;
        blocked.insert(task.resource.clone());
        continue;
      }

      let outcome = self.deliver(&task).await;
      self.in_flight.release(&task.resource, task.id);

      match outcome? {
        Some(TaskStatus::Done) => report.delivered.push(task.id),
        Some(TaskStatus::Failed) => {
          report.failed.push(task.id);
          blocked.insert(task.resource.clone());
        }
        Some(_) => {
          let retry_at = self.queue.get(task.id)?.map(|t| t.next_attempt_at);
          if let Some(at) = retry_at {
            report.next_retry_at = earliest(report.next_retry_at, at);
          }
          report.deferred += 1;
          blocked.insert(task.resource.clone());
        }
        None => {
          blocked.insert(task.resource.clone());
        }
      }
    }

    if !report.delivered.is_empty() || !report.failed.is_empty() {
      info!(
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        deferred = report.deferred,
        "replay pass finished"
      );
    }
    Ok(report)
  }

  /// Deliver one task. `None` means the task could not be claimed.
  async fn deliver(&self, task: &SyncTask) -> Result<Option<TaskStatus>> {
    if !self.queue.claim(task.id)? {
      return Ok(None);
    }

    match self.attempt(task).await {
      Ok(status) => Ok(Some(status)),
      Err(e) => {
        // Left in-flight, the task would block its resource until the next restart.
        if let Err(release) = self.queue.release(task.id) {
          warn!(task_id = task.id, error = %release, "failed to hand back claimed task");
        }
        Err(e)
      }
    }
  }

  async fn attempt(&self, task: &SyncTask) -> Result<TaskStatus> {
    let request = match task.to_request() {
      Ok(request) => request,
      Err(e) => {
        self.queue.reject(task.id, &e.to_string())?;
        self.report(task.id, TaskStatus::Failed);
        return Ok(TaskStatus::Failed);
      }
    };

    let attempt = classify(fetch_with_timeout(self.network.as_ref(), request, self.timeout).await);
    let status = match attempt {
      Attempt::Delivered => {
        self.queue.complete(task.id)?;
        debug!(task_id = task.id, "task delivered");
        TaskStatus::Done
      }
      Attempt::Rejected(reason) => {
        warn!(task_id = task.id, %reason, "server rejected queued mutation");
        self.queue.reject(task.id, &reason)?;
        TaskStatus::Failed
      }
      Attempt::Transient(reason) => {
        let attempts = task.attempts + 1;
        let retry_at = Utc::now()
          + chrono::Duration::from_std(self.backoff.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());
        let status = self
          .queue
          .record_failure(task.id, &reason, self.max_attempts, retry_at)?;
        if status == TaskStatus::Failed {
          warn!(task_id = task.id, attempts, %reason, "task exhausted its attempts");
        } else {
          debug!(task_id = task.id, attempts, %reason, %retry_at, "task will be retried");
        }
        status
      }
    };

    if matches!(status, TaskStatus::Done | TaskStatus::Failed) {
      self.report(task.id, status);
    }
    Ok(status)
  }

  fn report(&self, task_id: i64, status: TaskStatus) {
    self
      .bridge
      .emit(RuntimeMessage::SyncResult { task_id, status });
  }
}

fn classify(result: Result<Response, FetchError>) -> Attempt {
  match result {
    Ok(response) if response.status == 408 || response.status == 429 => {
      Attempt::Transient(format!("HTTP {}", response.status))
    }
    Ok(response) if response.is_server_error() => {
      Attempt::Transient(FetchError::ServerError(response.status).to_string())
    }
    Ok(response) if response.is_client_error() => {
      Attempt::Rejected(format!("HTTP {}", response.status))
    }
    Ok(_) => Attempt::Delivered,
    Err(e) => Attempt::Transient(e.to_string()),
  }
}

fn earliest(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
  Some(current.map_or(candidate, |c| c.min(candidate)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::{Method, Request};
  use crate::testing::ScriptedNetwork;
  use url::Url;

  struct Harness {
    replayer: Replayer,
    network: ScriptedNetwork,
    page: crate::bridge::PageHandle,
  }

  fn harness(max_attempts: u32) -> Harness {
    let network = ScriptedNetwork::new();
    let (bridge, _inbox) = HostBridge::channel();
    let page = bridge.connect();
    let config = SyncConfig {
      max_attempts,
      base_backoff_ms: 0,
      ..SyncConfig::default()
    };
    let replayer = Replayer::new(
      SyncQueue::new(Database::open_in_memory().unwrap()),
      Arc::new(network.clone()),
      bridge,
      Duration::from_secs(1),
      &config,
    );
    Harness {
      replayer,
      network,
      page,
    }
  }

  fn post(url: &str) -> Request {
    Request::new(Method::Post, Url::parse(url).unwrap()).with_body("{}")
  }

  fn results(page: &mut crate::bridge::PageHandle) -> Vec<(i64, TaskStatus)> {
    std::iter::from_fn(|| page.try_recv())
      .filter_map(|m| match m {
        RuntimeMessage::SyncResult { task_id, status } => Some((task_id, status)),
        _ => None,
      })
      .collect()
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let backoff = Backoff {
      base: Duration::from_secs(1),
      max: Duration::from_secs(10),
    };
    assert_eq!(backoff.delay(1), Duration::from_secs(1));
    assert_eq!(backoff.delay(2), Duration::from_secs(2));
    assert_eq!(backoff.delay(4), Duration::from_secs(8));
    assert_eq!(backoff.delay(5), Duration::from_secs(10));
    assert_eq!(backoff.delay(40), Duration::from_secs(10));
  }

  #[test]
  fn test_in_flight_marker_is_per_resource() {
    let in_flight = InFlight::default();
    assert!(in_flight.try_acquire("contact", 1));
    assert!(!in_flight.try_acquire("contact", 2));
    assert!(in_flight.try_acquire("profile", 3));
    // Only the owner can release.
    in_flight.release("contact", 2);
    assert!(!in_flight.try_acquire("contact", 2));
    in_flight.release("contact", 1);
    assert!(in_flight.try_acquire("contact", 2));
  }

  #[tokio::test]
  async fn test_replays_in_enqueue_order_exactly_once() {
    let mut h = harness(5);
    let url = "https://app.test/api/contact";
    h.network.respond(url, Response::new(201, "ok"));

    let ids: Vec<i64> = (0..3)
      .map(|_| h.replayer.queue().enqueue(&post(url)).unwrap().id)
      .collect();

    let report = h.replayer.run_pass().await.unwrap();
    assert_eq!(report.delivered, ids);
    assert_eq!(h.network.call_count(url), 3);

    let keys: Vec<_> = h.network.calls().iter().map(|r| r.idempotency_key.clone()).collect();
    assert!(keys.iter().all(Option::is_some));

    // Nothing left: a second pass sends nothing.
    let report = h.replayer.run_pass().await.unwrap();
    assert_eq!(report, PassReport::default());
    assert_eq!(h.network.call_count(url), 3);

    let expected: Vec<_> = ids.iter().map(|id| (*id, TaskStatus::Done)).collect();
    assert_eq!(results(&mut h.page), expected);
  }

  #[tokio::test]
  async fn test_bookkeeping_error_hands_task_back() {
    let db = Database::open_in_memory().unwrap();
    let network = ScriptedNetwork::new();
    let (bridge, _inbox) = HostBridge::channel();
    let queue = SyncQueue::new(db.clone());
    let replayer = Replayer::new(
      queue.clone(),
      Arc::new(network.clone()),
      bridge,
      Duration::from_secs(1),
      &SyncConfig::default(),
    );
    let url = "https://app.test/api/contact";
    network.respond(url, Response::new(201, "ok"));
    let id = queue.enqueue(&post(url)).unwrap().id;

    let block_deletes = "CREATE TRIGGER no_delete BEFORE DELETE ON sync_tasks
       BEGIN SELECT RAISE(ABORT, 'disk full'); END;";
    db.with_conn(|conn| Ok(conn.execute_batch(block_deletes)?)).unwrap();
    assert!(replayer.run_pass().await.is_err());
    assert_eq!(queue.get(id).unwrap().unwrap().status, TaskStatus::Pending);

    db.with_conn(|conn| Ok(conn.execute_batch("DROP TRIGGER no_delete")?)).unwrap();
    let report = replayer.run_pass().await.unwrap();
    assert_eq!(report.delivered, vec![id]);
  }

  #[tokio::test]
  async fn test_failed_task_blocks_only_its_resource() {
    let mut h = harness(5);
    let contact = "https://app.test/api/contact";
    let profile = "https://app.test/api/profile";
    h.network.fail(contact, FetchError::Offline("down".into()));
    h.network.respond(profile, Response::ok("saved"));

    let first = h.replayer.queue().enqueue(&post(contact)).unwrap();
    let later_same = h.replayer.queue().enqueue(&post(contact)).unwrap();

    for _ in 0..5 {
      h.replayer.run_pass().await.unwrap();
    }
    let first = h.replayer.queue().get(first.id).unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.attempts, 5);
    // The later task for the same resource was never attempted.
    assert_eq!(h.network.call_count(contact), 5);

    let unrelated = h.replayer.queue().enqueue(&post(profile)).unwrap();
    h.network.respond(contact, Response::ok("back"));
    let report = h.replayer.run_pass().await.unwrap();

    assert_eq!(report.delivered, vec![unrelated.id]);
    assert_eq!(
      h.replayer.queue().get(later_same.id).unwrap().unwrap().status,
      TaskStatus::Pending
    );
    assert_eq!(
      results(&mut h.page),
      vec![(first.id, TaskStatus::Failed), (unrelated.id, TaskStatus::Done)]
    );
  }

  #[tokio::test]
  async fn test_client_error_fails_task_immediately() {
    let mut h = harness(5);
    let url = "https://app.test/api/orders";
    h.network.respond(url, Response::new(422, "invalid"));
    let task = h.replayer.queue().enqueue(&post(url)).unwrap();

    let report = h.replayer.run_pass().await.unwrap();
    assert_eq!(report.failed, vec![task.id]);
    let task = h.replayer.queue().get(task.id).unwrap().unwrap();
    assert_eq!(task.last_error.as_deref(), Some("HTTP 422"));
    assert_eq!(results(&mut h.page), vec![(task.id, TaskStatus::Failed)]);
  }

  #[tokio::test]
  async fn test_server_error_is_retried_with_backoff() {
    let network = ScriptedNetwork::new();
    let (bridge, _inbox) = HostBridge::channel();
    let config = SyncConfig {
      base_backoff_ms: 60_000,
      ..SyncConfig::default()
    };
    let replayer = Replayer::new(
      SyncQueue::new(Database::open_in_memory().unwrap()),
      Arc::new(network.clone()),
      bridge,
      Duration::from_secs(1),
      &config,
    );
    let url = "https://app.test/api/orders";
    network.respond(url, Response::new(503, "busy"));
    let task = replayer.queue().enqueue(&post(url)).unwrap();

    let report = replayer.run_pass().await.unwrap();
    assert_eq!(report.deferred, 1);
    let retry_at = report.next_retry_at.unwrap();
    assert!(retry_at > Utc::now() + chrono::Duration::seconds(50));

    // Backoff not elapsed: the next pass does not hit the network.
    replayer.run_pass().await.unwrap();
    assert_eq!(network.call_count(url), 1);
    assert_eq!(replayer.queue().get(task.id).unwrap().unwrap().attempts, 1);
  }
}
