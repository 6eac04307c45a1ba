//! Worker registry: liveness records keyed by OS process id.

use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{WorkerRecord, format_ts, parse_ts};
use crate::telemetry::metrics;

/// What a reaping pass cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Pids whose registrations were removed.
    pub workers: Vec<u32>,
    /// Jobs those workers held, now back to `pending`.
    pub requeued_jobs: u64,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.requeued_jobs == 0
    }
}

impl super::Db {
    /// Record a starting worker. A stale record left by an earlier process
    /// with the same pid is replaced.
    pub async fn register_worker(&self, pid: u32) -> Result<WorkerRecord> {
        let now = Utc::now();
        let ts = format_ts(now);

        sqlx::query(
            "INSERT OR REPLACE INTO workers (pid, started_at, last_heartbeat) VALUES (?, ?, ?)",
        )
        .bind(i64::from(pid))
        .bind(&ts)
        .bind(&ts)
        .execute(self.pool())
        .await?;

        Ok(WorkerRecord {
            pid,
            started_at: now,
            last_heartbeat: now,
        })
    }

    /// Refresh `last_heartbeat`. Returns false if the worker is not registered.
    pub async fn heartbeat(&self, pid: u32) -> Result<bool> {
        let updated = sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE pid = ?")
            .bind(format_ts(Utc::now()))
            .bind(i64::from(pid))
            .execute(self.pool())
            .await?
            .rows_affected();

        Ok(updated > 0)
    }

    /// Remove a worker's record. Idempotent; returns whether a row existed.
    pub async fn unregister_worker(&self, pid: u32) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM workers WHERE pid = ?")
            .bind(i64::from(pid))
            .execute(self.pool())
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }

    /// Registered workers, most recently started first.
    pub async fn list_active_workers(&self) -> Result<Vec<WorkerRecord>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT pid, started_at, last_heartbeat FROM workers ORDER BY started_at DESC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(pid, started_at, last_heartbeat)| {
                Ok(WorkerRecord {
                    pid: pid as u32,
                    started_at: parse_ts(&started_at)?,
                    last_heartbeat: parse_ts(&last_heartbeat)?,
                })
            })
            .collect()
    }

    /// Drop workers silent for longer than `stale_after` and put the jobs they
    /// were processing back to `pending` (attempts unchanged).
    pub async fn reap_stale_workers(&self, stale_after: Duration) -> Result<ReapReport> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| Error::Validation(format!("stale threshold out of range: {e}")))?;
        let now = Utc::now();
        let cutoff = format_ts(now - stale_after);

        let mut tx = self.pool().begin().await?;

        let requeued_jobs = sqlx::query(
            "UPDATE jobs
             SET state = 'pending', updated_at = ?, worker_pid = NULL, retry_at = NULL,
                 error = 'worker ' || worker_pid || ' stopped heartbeating'
             WHERE state = 'processing'
               AND worker_pid IN (SELECT pid FROM workers WHERE last_heartbeat < ?)",
        )
        .bind(format_ts(now))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let pids: Vec<(i64,)> =
            sqlx::query_as("DELETE FROM workers WHERE last_heartbeat < ? RETURNING pid")
                .bind(&cutoff)
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;

        let report = ReapReport {
            workers: pids.into_iter().map(|(pid,)| pid as u32).collect(),
            requeued_jobs,
        };

        if !report.is_empty() {
            metrics::workers_reaped().add(report.workers.len() as u64, &[]);
            warn!(
                workers = ?report.workers,
                requeued_jobs = report.requeued_jobs,
                "reaped stale workers"
            );
        } else {
            debug!("no stale workers");
        }

        Ok(report)
    }
}
