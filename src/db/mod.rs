pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Database connection wrapper shared by the cache store, the sync queue and runtime state.
///
/// Every store holds a clone; SQLite remains the single durable substrate, so anything
/// written here survives the runtime being terminated between events.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at the given location
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database (tests, ephemeral runs)
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-runtime").join("runtime.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute_batch(schema::SCHEMA)
        .map_err(|e| eyre!("Failed to run migrations: {}", e))
    })
  }

  /// Run `f` with exclusive access to the connection.
  pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&conn)
  }

  /// Run `f` inside a transaction; it commits only if `f` returns `Ok`.
  pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let value = f(&tx)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(value)
  }

  /// Read a JSON document from the runtime state table.
  pub fn load_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = self.with_conn(|conn| {
      conn
        .query_row(
          "SELECT value FROM runtime_state WHERE key = ?",
          params![key],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read state {}: {}", key, e))
    })?;

    raw
      .map(|json| {
        serde_json::from_str(&json).map_err(|e| eyre!("Failed to parse state {}: {}", key, e))
      })
      .transpose()
  }

  /// Write (replace) a JSON document in the runtime state table.
  pub fn store_state<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let json =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize state {}: {}", key, e))?;
    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO runtime_state (key, value, updated_at)
           VALUES (?, ?, datetime('now'))",
          params![key, json],
        )
        .map_err(|e| eyre!("Failed to store state {}: {}", key, e))?;
      Ok(())
    })
  }

  pub fn delete_state(&self, key: &str) -> Result<bool> {
    self.with_conn(|conn| {
      let removed = conn
        .execute("DELETE FROM runtime_state WHERE key = ?", params![key])
        .map_err(|e| eyre!("Failed to delete state {}: {}", key, e))?;
      Ok(removed > 0)
    })
  }
}
