/// Schema for the runtime's durable state.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Response snapshots, one row per (namespace, request identity)
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    tier TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    stored_at_ms INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (namespace, method, url)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(namespace, stored_at_ms);

-- Mutations waiting for delivery, replayed in id order
CREATE TABLE IF NOT EXISTS sync_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    payload BLOB,
    idempotency_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    next_attempt_at_ms INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_tasks_resource
    ON sync_tasks(resource, status);

-- Small JSON documents: registration, push subscription
CREATE TABLE IF NOT EXISTS runtime_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
