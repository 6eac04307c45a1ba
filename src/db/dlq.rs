//! Dead-letter queue: list, count, and move entries back into the jobs table.

use chrono::Utc;
use tracing::info;

use super::map_unique_violation;
use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    /// Dead-letter entries, most recently failed first.
    pub async fn list_dlq(&self, limit: u32, offset: u32) -> Result<Vec<DeadLetterEntry>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            "SELECT id, command, attempts, created_at, failed_at, error
             FROM dead_letter_queue
             ORDER BY failed_at DESC
             LIMIT ? OFFSET ?",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(DeadLetterRow::try_into_entry).collect()
    }

    pub async fn count_dlq(&self) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(self.pool())
            .await?;
        Ok(n as u64)
    }

    /// Look up one dead-letter entry.
    pub async fn get_dlq_entry(&self, id: &JobId) -> Result<Option<DeadLetterEntry>> {
        let row: Option<DeadLetterRow> = sqlx::query_as(
            "SELECT id, command, attempts, created_at, failed_at, error
             FROM dead_letter_queue WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.map(DeadLetterRow::try_into_entry).transpose()
    }

    /// Move a dead-letter entry back into the jobs table as a fresh pending
    /// job with zero attempts. The DLQ row is deleted in the same transaction.
    ///
    /// Fails with `NotFound` if the id is not dead-lettered, and with
    /// `Duplicate` if a live job already uses the id (the entry stays put).
    pub async fn retry_dlq(&self, id: &JobId) -> Result<Job> {
        let max_retries = self.max_retries().await?;
        let now = format_ts(Utc::now());

        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
             SELECT id, command, 'pending', 0, ?, created_at, ? FROM dead_letter_queue
             WHERE id = ?",
        )
        .bind(i64::from(max_retries))
        .bind(&now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, || format!("job {id} is already queued")))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Err(Error::NotFound(format!("job {id} in dead-letter queue")));
        }

        sqlx::query("DELETE FROM dead_letter_queue WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(job_id = %id, max_retries, "dead-letter entry requeued");

        self.get_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: String,
    command: String,
    attempts: i64,
    created_at: String,
    failed_at: String,
    error: Option<String>,
}

impl DeadLetterRow {
    fn try_into_entry(self) -> Result<DeadLetterEntry> {
        Ok(DeadLetterEntry {
            id: JobId(self.id),
            command: self.command,
            attempts: self.attempts as u32,
            created_at: parse_ts(&self.created_at)?,
            failed_at: parse_ts(&self.failed_at)?,
            error: self.error,
        })
    }
}
