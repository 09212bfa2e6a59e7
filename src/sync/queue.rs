//! SQLite-backed durable queue of sync tasks.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use super::task::{new_idempotency_key, SyncTask, TaskStatus};
use crate::db::Database;
use crate::http::Request;

const TASK_COLUMNS: &str = "id, resource, endpoint, method, headers, payload, idempotency_key,
  created_at, attempts, status, next_attempt_at_ms, last_error";

/// Counts reported to the host page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  /// Tasks still to be delivered (pending or in flight)
  pub pending: usize,
  pub failed: usize,
}

/// Persisted, ordered list of mutations that could not complete online.
///
/// Ids come from an AUTOINCREMENT column, so they are unique and strictly increasing
/// even across deletions and restarts; replay order is id order.
#[derive(Clone)]
pub struct SyncQueue {
  db: Database,
}

impl SyncQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Append a task in `pending` state and persist it before returning.
  pub fn enqueue(&self, request: &Request) -> Result<SyncTask> {
    let created_at = Utc::now();
    let resource = request.resource_key();
    let endpoint = request.url.to_string();
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let idempotency_key = request
      .idempotency_key
      .clone()
      .unwrap_or_else(|| new_idempotency_key(request));

    let id = self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT INTO sync_tasks
             (resource, endpoint, method, headers, payload, idempotency_key, created_at,
              attempts, status, next_attempt_at_ms)
           VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 0)",
          params![
            resource,
            endpoint,
            request.method.as_str(),
            headers,
            request.body,
            idempotency_key,
            created_at.to_rfc3339(),
            TaskStatus::Pending.as_str(),
          ],
        )
        .map_err(|e| eyre!("Failed to enqueue task: {}", e))?;
      Ok(conn.last_insert_rowid())
    })?;

    info!(
      task_id = id,
      method = %request.method,
      endpoint = %request.url,
      "queued mutation for replay"
    );
    self
      .get(id)?
      .ok_or_else(|| eyre!("Task {} vanished after enqueue", id))
  }

  pub fn get(&self, id: i64) -> Result<Option<SyncTask>> {
    self.db.with_conn(|conn| {
      conn
        .query_row(
          &format!("SELECT {} FROM sync_tasks WHERE id = ?", TASK_COLUMNS),
          params![id],
          |row| Ok(read_task(row)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read task {}: {}", id, e))?
        .transpose()
    })
  }

  /// Every task, in replay order.
  pub fn list(&self) -> Result<Vec<SyncTask>> {
    self.select(&format!("SELECT {} FROM sync_tasks ORDER BY id", TASK_COLUMNS))
  }

  /// Tasks a replay pass has to look at, in id order.
  pub fn replayable(&self) -> Result<Vec<SyncTask>> {
    self.select(&format!(
      "SELECT {} FROM sync_tasks WHERE status IN ('pending', 'failed') ORDER BY id",
      TASK_COLUMNS
    ))
  }

  fn select(&self, sql: &str) -> Result<Vec<SyncTask>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare(sql)
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let rows = stmt
        .query_map([], |row| Ok(read_task(row)))
        .map_err(|e| eyre!("Failed to query tasks: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read task row: {}", e))?;

      rows.into_iter().collect()
    })
  }

  pub fn counts(&self) -> Result<QueueCounts> {
    self.db.with_conn(|conn| {
      let count = |status: &str| -> Result<usize> {
        let n: i64 = conn
          .query_row(
            "SELECT COUNT(*) FROM sync_tasks WHERE status = ?",
            params![status],
            |row| row.get(0),
          )
          .map_err(|e| eyre!("Failed to count tasks: {}", e))?;
        Ok(usize::try_from(n).unwrap_or_default())
      };

      Ok(QueueCounts {
        pending: count(TaskStatus::Pending.as_str())? + count(TaskStatus::InFlight.as_str())?,
        failed: count(TaskStatus::Failed.as_str())?,
      })
    })
  }

  /// Whether any undelivered task exists for the resource.
  pub fn has_outstanding(&self, resource: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let n: i64 = conn
        .query_row(
          "SELECT COUNT(*) FROM sync_tasks WHERE resource = ?",
          params![resource],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count tasks: {}", e))?;
      Ok(n > 0)
    })
  }

  /// Move a task from `pending` to `in-flight`. Returns false if someone else got there first.
  pub fn claim(&self, id: i64) -> Result<bool> {
    self.set_status_if(id, TaskStatus::Pending, TaskStatus::InFlight)
  }

  /// Hand a claimed task back without counting an attempt.
  pub fn release(&self, id: i64) -> Result<bool> {
    self.set_status_if(id, TaskStatus::InFlight, TaskStatus::Pending)
  }

  /// Delivered: the task is removed.
  pub fn complete(&self, id: i64) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute("DELETE FROM sync_tasks WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to complete task {}: {}", id, e))?;
      Ok(())
    })
  }

  /// Count a failed attempt. The task goes back to `pending` with a retry time,
  /// or to `failed` once `max_attempts` is reached.
  pub fn record_failure(
    &self,
    id: i64,
    error: &str,
    max_attempts: u32,
    next_attempt_at: DateTime<Utc>,
  ) -> Result<TaskStatus> {
    self.db.transaction(|tx| {
      let attempts: u32 = tx
        .query_row(
          "SELECT attempts FROM sync_tasks WHERE id = ?",
          params![id],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to read task {}: {}", id, e))?;
      let attempts = attempts + 1;
      let status = if attempts >= max_attempts {
        TaskStatus::Failed
      } else {
        TaskStatus::Pending
      };

      tx.execute(
        "UPDATE sync_tasks SET attempts = ?, status = ?, next_attempt_at_ms = ?, last_error = ?
         WHERE id = ?",
        params![
          attempts,
          status.as_str(),
          next_attempt_at.timestamp_millis(),
          error,
          id
        ],
      )
      .map_err(|e| eyre!("Failed to record failure for task {}: {}", id, e))?;

      Ok(status)
    })
  }

  /// The server refused the task outright; retrying cannot help.
  pub fn reject(&self, id: i64, error: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "UPDATE sync_tasks SET attempts = attempts + 1, status = 'failed', last_error = ?
           WHERE id = ?",
          params![error, id],
        )
        .map_err(|e| eyre!("Failed to reject task {}: {}", id, e))?;
      Ok(())
    })
  }

  /// Drop a task on the user's request.
  pub fn discard(&self, id: i64) -> Result<bool> {
    self.db.with_conn(|conn| {
      let removed = conn
        .execute(
          "DELETE FROM sync_tasks WHERE id = ? AND status != 'in-flight'",
          params![id],
        )
        .map_err(|e| eyre!("Failed to discard task {}: {}", id, e))?;
      Ok(removed > 0)
    })
  }

  /// Give a failed task a fresh set of attempts.
  pub fn retry(&self, id: i64) -> Result<bool> {
    self.db.with_conn(|conn| {
      let updated = conn
        .execute(
          "UPDATE sync_tasks SET status = 'pending', attempts = 0, next_attempt_at_ms = 0
           WHERE id = ? AND status = 'failed'",
          params![id],
        )
        .map_err(|e| eyre!("Failed to retry task {}: {}", id, e))?;
      Ok(updated > 0)
    })
  }

  /// Tasks left `in-flight` by a terminated runtime go back to `pending`.
  pub fn recover_in_flight(&self) -> Result<usize> {
    let recovered = self.db.with_conn(|conn| {
      conn
        .execute(
          "UPDATE sync_tasks SET status = 'pending' WHERE status = 'in-flight'",
          [],
        )
        .map_err(|e| eyre!("Failed to recover in-flight tasks: {}", e))
    })?;
    if recovered > 0 {
      info!(recovered, "requeued tasks interrupted mid-delivery");
    }
    Ok(recovered)
  }

  fn set_status_if(&self, id: i64, from: TaskStatus, to: TaskStatus) -> Result<bool> {
    self.db.with_conn(|conn| {
      let updated = conn
        .execute(
          "UPDATE sync_tasks SET status = ? WHERE id = ? AND status = ?",
          params![to.as_str(), id, from.as_str()],
        )
        .map_err(|e| eyre!("Failed to update task {}: {}", id, e))?;
      debug!(task_id = id, from = %from, to = %to, updated, "task status transition");
      Ok(updated > 0)
    })
  }
}

fn read_task(row: &Row<'_>) -> Result<SyncTask> {
  let column = |e: rusqlite::Error| eyre!("Failed to read task column: {}", e);

  let method: String = row.get(3).map_err(column)?;
  let headers: String = row.get(4).map_err(column)?;
  let created_at: String = row.get(7).map_err(column)?;
  let status: String = row.get(9).map_err(column)?;
  let next_attempt_ms: i64 = row.get(10).map_err(column)?;

  Ok(SyncTask {
    id: row.get(0).map_err(column)?,
    resource: row.get(1).map_err(column)?,
    endpoint: row.get(2).map_err(column)?,
    method: method.parse().map_err(|e: String| eyre!(e))?,
    headers: serde_json::from_str(&headers).map_err(|e| eyre!("Corrupt task headers: {}", e))?,
    payload: row.get(5).map_err(column)?,
    idempotency_key: row.get(6).map_err(column)?,
    created_at: DateTime::parse_from_rfc3339(&created_at)
      .map_err(|e| eyre!("Corrupt task timestamp {}: {}", created_at, e))?
      .with_timezone(&Utc),
    attempts: row.get(8).map_err(column)?,
    status: status.parse().map_err(|e: String| eyre!(e))?,
    next_attempt_at: Utc
      .timestamp_millis_opt(next_attempt_ms)
      .single()
      .ok_or_else(|| eyre!("Corrupt retry timestamp {}", next_attempt_ms))?,
    last_error: row.get(11).map_err(column)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Method;
  use url::Url;

  fn queue() -> SyncQueue {
    SyncQueue::new(Database::open_in_memory().unwrap())
  }

  fn post(path: &str) -> Request {
    Request::new(
      Method::Post,
      Url::parse(&format!("https://app.test{}", path)).unwrap(),
    )
    .with_body(r#"{"name":"Ada"}"#)
  }

  #[test]
  fn test_enqueue_assigns_increasing_ids_and_keys() {
    let q = queue();
    let first = q.enqueue(&post("/api/contact")).unwrap();
    let second = q
      .enqueue(&post("/api/contact").with_idempotency_key("client-key-2"))
      .unwrap();

    assert!(second.id > first.id);
    assert_eq!(first.status, TaskStatus::Pending);
    assert_eq!(first.attempts, 0);
    assert_eq!(first.idempotency_key.len(), 32);
    assert_eq!(second.idempotency_key, "client-key-2");
    assert_eq!(first.payload.as_deref(), Some(&br#"{"name":"Ada"}"#[..]));
  }

  #[test]
  fn test_ids_never_reused_after_delete() {
    let q = queue();
    let first = q.enqueue(&post("/api/a")).unwrap();
    q.complete(first.id).unwrap();
    let second = q.enqueue(&post("/api/a")).unwrap();
    assert!(second.id > first.id);
  }

  #[test]
  fn test_claim_is_exclusive() {
    let q = queue();
    let task = q.enqueue(&post("/api/a")).unwrap();
    assert!(q.claim(task.id).unwrap());
    assert!(!q.claim(task.id).unwrap());
    assert_eq!(q.counts().unwrap(), QueueCounts { pending: 1, failed: 0 });
  }

  #[test]
  fn test_failure_caps_attempts() {
    let q = queue();
    let task = q.enqueue(&post("/api/a")).unwrap();
    let now = Utc::now();
    for _ in 0..4 {
      assert_eq!(q.record_failure(task.id, "offline", 5, now).unwrap(), TaskStatus::Pending);
    }
    assert_eq!(q.record_failure(task.id, "offline", 5, now).unwrap(), TaskStatus::Failed);

    let task = q.get(task.id).unwrap().unwrap();
    assert_eq!(task.attempts, 5);
    assert_eq!(task.last_error.as_deref(), Some("offline"));
    assert_eq!(q.counts().unwrap(), QueueCounts { pending: 0, failed: 1 });
  }

  #[test]
  fn test_retry_and_discard_failed_task() {
    let q = queue();
    let task = q.enqueue(&post("/api/a")).unwrap();
    q.reject(task.id, "HTTP 422").unwrap();

    assert!(q.retry(task.id).unwrap());
    let task = q.get(task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);

    assert!(q.discard(task.id).unwrap());
    assert!(q.get(task.id).unwrap().is_none());
    assert!(!q.has_outstanding(&task.resource).unwrap());
  }

  #[test]
  fn test_tasks_survive_restart_and_in_flight_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.db");

    let id = {
      let q = SyncQueue::new(Database::open(&path).unwrap());
      let task = q.enqueue(&post("/api/contact")).unwrap();
      assert!(q.claim(task.id).unwrap());
      task.id
    };

    let q = SyncQueue::new(Database::open(&path).unwrap());
    assert_eq!(q.recover_in_flight().unwrap(), 1);
    let task = q.get(id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.endpoint, "https://app.test/api/contact");
  }
}
