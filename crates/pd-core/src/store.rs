//! The embedded SQLite store. One daemon process is the exclusive writer;
//! all access funnels through a single connection actor so multi-row
//! mutations serialize naturally. Write-ahead logging is enabled and the
//! schema is applied idempotently at open, versioned through a
//! `migrations` table.

use std::path::Path;

use tokio_rusqlite::Connection;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

/// Owner of the embedded database.
///
/// Cloning shares the underlying connection actor, so every clone still
/// observes the single-writer discipline.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

const SCHEMA_VERSION: i64 = 1;

impl Store {
    /// Open (or create) the database at `path` and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    /// A purely in-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    /// Run a closure against the connection actor. Use
    /// `conn.transaction()` inside the closure for multi-row mutations;
    /// the actor thread guarantees no interleaving with other callers.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| f(conn).map_err(tokio_rusqlite::Error::from))
            .await
            .map_err(StoreError::from)
    }

    /// Close the connection actor, flushing WAL state.
    pub async fn close(self) {
        let _ = self.conn.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let applied: i64 = self
            .call(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode=WAL;
                     PRAGMA synchronous=NORMAL;
                     PRAGMA busy_timeout=5000;
                     PRAGMA foreign_keys=ON;

                     CREATE TABLE IF NOT EXISTS migrations (
                         version    INTEGER PRIMARY KEY,
                         applied_at INTEGER NOT NULL
                     );",
                )?;
                conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM migrations",
                    [],
                    |r| r.get(0),
                )
            })
            .await?;

        if applied < SCHEMA_VERSION {
            self.call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute_batch(BASE_SCHEMA)?;
                tx.execute(
                    "INSERT OR IGNORE INTO migrations (version, applied_at) VALUES (?1, ?2)",
                    rusqlite::params![SCHEMA_VERSION, chrono::Utc::now().timestamp_millis()],
                )?;
                tx.commit()
            })
            .await?;
            info!(version = SCHEMA_VERSION, "store schema applied");
        }
        Ok(())
    }
}

const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS services (
    id              TEXT PRIMARY KEY,
    port            INTEGER UNIQUE,
    pid             INTEGER,
    cmd             TEXT,
    cwd             TEXT,
    status          TEXT NOT NULL DEFAULT 'assigned',
    created_at      INTEGER NOT NULL,
    last_seen       INTEGER NOT NULL,
    expires_at      INTEGER,
    restart_policy  TEXT,
    health_url      TEXT,
    tunnel_provider TEXT,
    tunnel_url      TEXT,
    paired_with     TEXT,
    agent_id        TEXT,
    metadata        TEXT
);
CREATE INDEX IF NOT EXISTS idx_services_agent  ON services(agent_id);
CREATE INDEX IF NOT EXISTS idx_services_status ON services(status);

CREATE TABLE IF NOT EXISTS endpoints (
    service_id TEXT NOT NULL,
    env        TEXT NOT NULL,
    url        TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (service_id, env)
);

CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    channel    TEXT NOT NULL,
    payload    TEXT NOT NULL,
    sender     TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel, id);

CREATE TABLE IF NOT EXISTS locks (
    name        TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    pid         INTEGER,
    acquired_at INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL,
    metadata    TEXT
);

CREATE TABLE IF NOT EXISTS agents (
    id               TEXT PRIMARY KEY,
    name             TEXT,
    type             TEXT,
    pid              INTEGER,
    registered_at    INTEGER NOT NULL,
    last_heartbeat   INTEGER NOT NULL,
    max_services     INTEGER NOT NULL,
    max_locks        INTEGER NOT NULL,
    identity_project TEXT,
    identity_stack   TEXT,
    identity_context TEXT,
    purpose          TEXT,
    worktree_id      TEXT,
    status           TEXT NOT NULL DEFAULT 'active'
);
CREATE INDEX IF NOT EXISTS idx_agents_project ON agents(identity_project);

CREATE TABLE IF NOT EXISTS resurrection_queue (
    old_id     TEXT PRIMARY KEY,
    new_id     TEXT,
    project    TEXT,
    purpose    TEXT,
    session_id TEXT,
    notes      TEXT NOT NULL DEFAULT '[]',
    state      TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_inbox (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id   TEXT NOT NULL,
    content    TEXT NOT NULL,
    sender     TEXT,
    read       INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_inbox_agent ON agent_inbox(agent_id, read);

CREATE TABLE IF NOT EXISTS sessions (
    id           TEXT PRIMARY KEY,
    purpose      TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'active',
    agent_id     TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_id, status);

CREATE TABLE IF NOT EXISTS session_files (
    session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    file_path   TEXT NOT NULL,
    claimed_at  INTEGER NOT NULL,
    released_at INTEGER,
    PRIMARY KEY (session_id, file_path)
);

CREATE TABLE IF NOT EXISTS session_notes (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    content    TEXT NOT NULL,
    type       TEXT NOT NULL DEFAULT 'note',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notes_session ON session_notes(session_id);

CREATE TABLE IF NOT EXISTS webhooks (
    id         TEXT PRIMARY KEY,
    url        TEXT NOT NULL,
    events     TEXT NOT NULL DEFAULT '[\"*\"]',
    secret     TEXT,
    filter     TEXT,
    active     INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    metadata   TEXT
);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id TEXT NOT NULL,
    event           TEXT NOT NULL,
    payload         TEXT NOT NULL,
    timestamp       INTEGER NOT NULL,
    status_code     INTEGER,
    success         INTEGER NOT NULL DEFAULT 0,
    attempts        INTEGER NOT NULL DEFAULT 0,
    next_retry_at   INTEGER,
    last_error      TEXT
);
CREATE INDEX IF NOT EXISTS idx_deliveries_pending
    ON webhook_deliveries(success, next_retry_at);

CREATE TABLE IF NOT EXISTS activity (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    type      TEXT NOT NULL,
    agent_id  TEXT,
    target_id TEXT,
    details   TEXT,
    metadata  TEXT
);
CREATE INDEX IF NOT EXISTS idx_activity_ts   ON activity(timestamp);
CREATE INDEX IF NOT EXISTS idx_activity_type ON activity(type);

CREATE TABLE IF NOT EXISTS projects (
    id           TEXT PRIMARY KEY,
    root         TEXT,
    type         TEXT,
    config       TEXT,
    services     TEXT,
    last_scanned INTEGER,
    created_at   INTEGER NOT NULL,
    metadata     TEXT
);
";

// ---------------------------------------------------------------------------
// Row helpers shared by the domain crates
// ---------------------------------------------------------------------------

/// Read an optional JSON TEXT column into a `serde_json::Value`.
pub fn json_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

/// Serialize an optional JSON value for storage in a TEXT column.
pub fn json_param(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_migrates_in_memory() {
        let store = Store::open_in_memory().await.unwrap();
        let version: i64 = store
            .call(|conn| {
                conn.query_row("SELECT MAX(version) FROM migrations", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn migration_is_idempotent_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.db");

        let store = Store::open(&path).await.unwrap();
        store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO services (id, port, status, created_at, last_seen)
                     VALUES ('myapp:api', 3100, 'assigned', 1, 1)",
                    [],
                )
            })
            .await
            .unwrap();
        store.close().await;

        let store = Store::open(&path).await.unwrap();
        let count: i64 = store
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM services", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn port_uniqueness_is_enforced() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO services (id, port, status, created_at, last_seen)
                     VALUES ('a', 3100, 'assigned', 1, 1)",
                    [],
                )
            })
            .await
            .unwrap();
        let dup = store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO services (id, port, status, created_at, last_seen)
                     VALUES ('b', 3100, 'assigned', 1, 1)",
                    [],
                )
            })
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn null_ports_do_not_collide() {
        let store = Store::open_in_memory().await.unwrap();
        for id in ["worker-a", "worker-b"] {
            store
                .call(move |conn| {
                    conn.execute(
                        "INSERT INTO services (id, port, status, created_at, last_seen)
                         VALUES (?1, NULL, 'assigned', 1, 1)",
                        rusqlite::params![id],
                    )
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn session_cascade_deletes_notes_and_claims() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .call(|conn| {
                conn.execute_batch(
                    "INSERT INTO sessions (id, purpose, created_at, updated_at)
                         VALUES ('s1', 'test', 1, 1);
                     INSERT INTO session_notes (session_id, content, created_at)
                         VALUES ('s1', 'note', 1);
                     INSERT INTO session_files (session_id, file_path, claimed_at)
                         VALUES ('s1', 'src/main.rs', 1);
                     DELETE FROM sessions WHERE id = 's1';",
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let (notes, files): (i64, i64) = store
            .call(|conn| {
                let notes =
                    conn.query_row("SELECT COUNT(*) FROM session_notes", [], |r| r.get(0))?;
                let files =
                    conn.query_row("SELECT COUNT(*) FROM session_files", [], |r| r.get(0))?;
                Ok((notes, files))
            })
            .await
            .unwrap();
        assert_eq!((notes, files), (0, 0));
    }
}
