//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::traits::{CacheEntry, CacheKey, CacheTier, Namespace};
use crate::db::Database;
use crate::http::{Method, Response};

/// Trait for cache storage backends.
///
/// Writes are atomic per key: a reader sees either the previous entry or the new one.
pub trait CacheStore: Send + Sync + 'static {
  /// Get an entry by request identity.
  fn get(&self, namespace: &Namespace, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Replace an entry wholesale. Returns the stored revision.
  fn put(&self, namespace: &Namespace, entry: &CacheEntry) -> Result<i64>;

  /// Store only if the current revision matches `expected` (`None`: key must be absent).
  fn compare_and_put(
    &self,
    namespace: &Namespace,
    entry: &CacheEntry,
    expected: Option<i64>,
  ) -> Result<bool>;

  /// Names of every namespace holding at least one entry.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Drop a namespace and everything in it.
  fn delete_namespace(&self, name: &str) -> Result<usize>;

  /// URLs stored in a namespace, oldest first.
  fn keys(&self, namespace: &Namespace) -> Result<Vec<String>>;

  /// Evict the oldest entries until at most `max_entries` remain.
  fn trim(&self, namespace: &Namespace, max_entries: usize) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteCacheStore {
  db: Database,
}

impl SqliteCacheStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

fn check_storable(entry: &CacheEntry) -> Result<()> {
  if entry.key.method != Method::Get {
    return Err(eyre!(
      "Refusing to cache {} {}: only GET responses are cached",
      entry.key.method,
      entry.key.url
    ));
  }
  if !entry.response.is_success() {
    return Err(eyre!(
      "Refusing to cache {}: HTTP {} is not a successful response",
      entry.key.url,
      entry.response.status
    ));
  }
  Ok(())
}

fn current_revision(conn: &Connection, namespace: &str, key: &CacheKey) -> Result<Option<i64>> {
  conn
    .query_row(
      "SELECT revision FROM cache_entries WHERE namespace = ? AND method = ? AND url = ?",
      params![namespace, key.method.as_str(), key.url],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read cache revision: {}", e))
}

fn write_entry(
  conn: &Connection,
  namespace: &str,
  entry: &CacheEntry,
  revision: i64,
) -> Result<()> {
  let headers = serde_json::to_string(&entry.response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (namespace, method, url, tier, status, headers, body, stored_at, stored_at_ms, revision)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        entry.key.method.as_str(),
        entry.key.url,
        entry.tier.as_str(),
        entry.response.status,
        headers,
        entry.response.body,
        entry.stored_at.to_rfc3339(),
        entry.stored_at.timestamp_millis(),
        revision,
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.key.url, e))?;

  Ok(())
}

impl CacheStore for SqliteCacheStore {
  fn get(&self, namespace: &Namespace, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let name = namespace.to_string();
    let row: Option<(String, u16, String, Vec<u8>, i64, i64)> = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT tier, status, headers, body, stored_at_ms, revision FROM cache_entries
           WHERE namespace = ? AND method = ? AND url = ?",
          params![name, key.method.as_str(), key.url],
          |row| {
            Ok((
              row.get(0)?,
              row.get(1)?,
              row.get(2)?,
              row.get(3)?,
              row.get(4)?,
              row.get(5)?,
            ))
          },
        )
        .optional()
        .map_err(|e| eyre!("Failed to read cache entry {}: {}", key.url, e))
    })?;

    let Some((tier, status, headers, body, stored_at_ms, revision)) = row else {
      return Ok(None);
    };

    let tier: CacheTier = tier.parse().map_err(|e: String| eyre!(e))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Corrupt headers for {}: {}", key.url, e))?;

    Ok(Some(CacheEntry {
      key: key.clone(),
      response: Response {
        status,
        headers,
        body,
      },
      stored_at: parse_millis(stored_at_ms)?,
      tier,
      revision,
    }))
  }

  fn put(&self, namespace: &Namespace, entry: &CacheEntry) -> Result<i64> {
    check_storable(entry)?;
    let name = namespace.to_string();

    self.db.transaction(|tx| {
      let revision = current_revision(tx, &name, &entry.key)?.unwrap_or(0) + 1;
      write_entry(tx, &name, entry, revision)?;
      Ok(revision)
    })
  }

  fn compare_and_put(
    &self,
    namespace: &Namespace,
    entry: &CacheEntry,
    expected: Option<i64>,
  ) -> Result<bool> {
    check_storable(entry)?;
    let name = namespace.to_string();

    self.db.transaction(|tx| {
      let current = current_revision(tx, &name, &entry.key)?;
      if current != expected {
        return Ok(false);
      }
      write_entry(tx, &name, entry, current.unwrap_or(0) + 1)?;
      Ok(true)
    })
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT DISTINCT namespace FROM cache_entries ORDER BY namespace")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let names = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read namespace: {}", e))?;

      Ok(names)
    })
  }

  fn delete_namespace(&self, name: &str) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .execute("DELETE FROM cache_entries WHERE namespace = ?", params![name])
        .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))
    })
  }

  fn keys(&self, namespace: &Namespace) -> Result<Vec<String>> {
    let name = namespace.to_string();
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare(
          "SELECT url FROM cache_entries WHERE namespace = ?
           ORDER BY stored_at_ms, url",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let urls = stmt
        .query_map(params![name], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

      Ok(urls)
    })
  }

  fn trim(&self, namespace: &Namespace, max_entries: usize) -> Result<usize> {
    let name = namespace.to_string();
    let keep = i64::try_from(max_entries).unwrap_or(i64::MAX);
    self.db.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM cache_entries WHERE namespace = ?1 AND url NOT IN (
             SELECT url FROM cache_entries WHERE namespace = ?1
             ORDER BY stored_at_ms DESC, url DESC LIMIT ?2
           )",
          params![name, keep],
        )
        .map_err(|e| eyre!("Failed to trim namespace {}: {}", name, e))
    })
  }
}

fn parse_millis(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid stored timestamp: {}", ms))
}
