//! Durable queue storage shared by every node.
//!
//! Jobs and nodes live in one SQLite database under the configured queue
//! directory. Each process opens its own connection; all access within a
//! process is serialized through a `Mutex<Connection>`. Every
//! read-modify-write sequence runs inside [`Database::exclusive`], which takes
//! SQLite's exclusive lock so that several worker processes can share the file
//! without double claims or lost updates.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

pub mod jobs;
pub mod nodes;

pub use jobs::{InsertOutcome, Job, JobKey, JobStatus, JobStore, QueueCounts};
pub use nodes::{Node, NodeKey, NodeMetadata, NodeRegistry, NodeStatus};

/// How long a connection waits for another process to release the lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Schema migrations, applied in order and tracked with `PRAGMA user_version`.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "create_jobs_table",
        "CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT PRIMARY KEY NOT NULL,
            path        TEXT NOT NULL UNIQUE,
            status      TEXT NOT NULL,
            output_path TEXT NOT NULL,
            log_path    TEXT NOT NULL,
            input_size  INTEGER,
            output_size INTEGER,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            started_at  TEXT,
            finished_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);",
    ),
    (
        "create_nodes_table",
        "CREATE TABLE IF NOT EXISTS nodes (
            id                TEXT PRIMARY KEY NOT NULL,
            hostname          TEXT NOT NULL UNIQUE,
            status            TEXT NOT NULL,
            became_online_at  TEXT,
            became_offline_at TEXT,
            cpu_threads       INTEGER NOT NULL,
            cpu_details       TEXT NOT NULL,
            quiet_periods     TEXT
        );",
    ),
];

/// Errors from queue storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced job or node does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The operation is incompatible with the record's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating the store directory.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Quiet periods column could not be encoded or decoded.
    #[error("Invalid JSON in store: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// A blocking store task panicked or was cancelled.
    #[error("Store task failed: {0}")]
    Task(String),
}

/// Thread-safe handle to the queue database.
///
/// Cloning is cheap (inner `Arc`).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and applies any
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        migrate(&mut conn)?;

        tracing::info!(path = %path.display(), "Queue database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a read-only closure against the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside an exclusive transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`. On any error,
    /// including a panic unwinding through `f`, the transaction is dropped and
    /// rolled back, releasing the database lock.
    pub fn exclusive<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Shortens the lock wait so contention tests fail fast.
    #[cfg(test)]
    pub(crate) fn set_busy_timeout(&self, wait: Duration) -> Result<(), StoreError> {
        self.with_conn(|conn| Ok(conn.busy_timeout(wait)?))
    }
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
    let applied: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (name, sql) in MIGRATIONS.iter().skip(applied.max(0) as usize) {
        tx.execute_batch(sql)?;
        tracing::debug!(migration = name, "Applied migration");
    }

    tx.execute_batch(&format!("PRAGMA user_version = {}", MIGRATIONS.len()))?;
    tx.commit()?;
    Ok(())
}

/// Runs a synchronous store call on the blocking thread pool.
pub async fn blocking<F, T>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
