//! Database handle, schema, and connection lifecycle.
//!
//! One SQLite file is the single source of truth shared by the CLI and every
//! worker process. WAL mode lets readers proceed during writes; the busy
//! timeout makes contending writers wait instead of failing.

pub mod dlq;
pub mod jobs;
pub mod settings;
pub mod workers;

use crate::error::{Error, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a connection waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY,
        command         TEXT NOT NULL,
        state           TEXT NOT NULL DEFAULT 'pending',
        attempts        INTEGER NOT NULL DEFAULT 0,
        max_retries     INTEGER NOT NULL DEFAULT 3,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        retry_at        TEXT,
        completed_at    TEXT,
        error           TEXT,
        output          TEXT,
        duration_ms     INTEGER,
        worker_pid      INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
    CREATE INDEX IF NOT EXISTS idx_jobs_retry ON jobs(state, retry_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

    CREATE TABLE IF NOT EXISTS dead_letter_queue (
        id              TEXT PRIMARY KEY,
        command         TEXT NOT NULL,
        attempts        INTEGER NOT NULL,
        created_at      TEXT NOT NULL,
        failed_at       TEXT NOT NULL,
        error           TEXT
    );

    CREATE TABLE IF NOT EXISTS config (
        key             TEXT PRIMARY KEY,
        value           TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    );

    INSERT OR IGNORE INTO config (key, value, updated_at)
        VALUES ('max-retries', '3', strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));
    INSERT OR IGNORE INTO config (key, value, updated_at)
        VALUES ('backoff-base', '2', strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));

    CREATE TABLE IF NOT EXISTS workers (
        pid             INTEGER PRIMARY KEY,
        started_at      TEXT NOT NULL,
        last_heartbeat  TEXT NOT NULL
    );
";

/// Database handle. Owns the connection pool; cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
    path: PathBuf,
}

impl Db {
    /// Open (creating if needed) the store at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self::connect(path).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Connect without touching the schema.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Ok(Self { pool, path })
    }

    /// Create tables, indexes, and config defaults. Idempotent, so any number
    /// of processes may run it against the same file.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Round-trip a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close every pooled connection. Further queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Map a unique-constraint violation to `Duplicate`, everything else to `Storage`.
pub(crate) fn map_unique_violation(err: sqlx::Error, what: impl FnOnce() -> String) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return Error::Duplicate(what());
        }
    }
    Error::Storage(err)
}
