//! Job operations: create, atomic claim, state updates, listing, counts.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::{QueryBuilder, Sqlite};
use std::time::Duration;
use tracing::{debug, info};

use super::map_unique_violation;
use crate::error::{Error, Result};
use crate::model::*;
use crate::retry::{self, RetryDecision};
use crate::telemetry::metrics;

/// Field changes applied alongside a state change by [`Db::update_job_state`](super::Db::update_job_state).
///
/// `updated_at` is always refreshed; everything else is left alone unless set here.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    attempts: Option<u32>,
    retry_at: Option<Option<DateTime<Utc>>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<Option<String>>,
    output: Option<String>,
    duration_ms: Option<u64>,
    worker_pid: Option<Option<u32>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.attempts = Some(n);
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.retry_at = Some(Some(at));
        self
    }

    pub fn clear_retry_at(mut self) -> Self {
        self.retry_at = Some(None);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn worker_pid(mut self, pid: Option<u32>) -> Self {
        self.worker_pid = Some(pid);
        self
    }
}

impl super::Db {
    /// Insert a new pending job. Without an explicit budget the job captures
    /// the current `max-retries` config value.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        new.validate()?;

        let id = new.id.map(JobId::from).unwrap_or_else(JobId::generate);
        let max_retries = match new.max_retries {
            Some(n) => n,
            None => self.max_retries().await?,
        };
        let now = format_ts(Utc::now());

        let row: JobRow = sqlx::query_as(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
             VALUES (?, ?, 'pending', 0, ?, ?, ?)
             RETURNING *",
        )
        .bind(id.as_str())
        .bind(&new.command)
        .bind(i64::from(max_retries))
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_unique_violation(e, || format!("job {id}")))?;

        metrics::jobs_enqueued().add(1, &[]);
        debug!(job_id = %id, max_retries, "job created");

        row.try_into_job()
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await?;

        row.map(JobRow::try_into_job).transpose()
    }

    /// Atomically claim the oldest eligible job for `worker_pid`.
    ///
    /// Eligible: `pending`, or `failed` with `retry_at` reached. Selection and
    /// the move to `processing` are one UPDATE statement, so SQLite's write
    /// lock serializes racing workers and each job is handed out once.
    /// Returns `None` immediately when nothing is eligible.
    pub async fn claim_next_job(&self, worker_pid: u32) -> Result<Option<Job>> {
        let now = format_ts(Utc::now());

        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE jobs
             SET state = 'processing', updated_at = ?, worker_pid = ?
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE state = 'pending'
                    OR (state = 'failed' AND retry_at IS NOT NULL AND retry_at <= ?)
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(&now)
        .bind(i64::from(worker_pid))
        .bind(&now)
        .fetch_optional(self.pool())
        .await?;

        metrics::job_claims().add(
            1,
            &[KeyValue::new(
                "result",
                if row.is_some() { "claimed" } else { "empty" },
            )],
        );

        row.map(JobRow::try_into_job).transpose()
    }

    /// Set a job's state plus any fields in `update`. Returns `None` if the
    /// job does not exist. No transition validation happens here.
    pub async fn update_job_state(
        &self,
        id: &JobId,
        state: JobState,
        update: JobUpdate,
    ) -> Result<Option<Job>> {
        if state == JobState::Dead {
            return Err(Error::Validation(
                "dead jobs live in the dead-letter queue; use mark_job_failed".to_string(),
            ));
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET state = ");
        qb.push_bind(state.as_str())
            .push(", updated_at = ")
            .push_bind(format_ts(Utc::now()));

        if let Some(attempts) = update.attempts {
            qb.push(", attempts = ").push_bind(i64::from(attempts));
        }
        if let Some(retry_at) = update.retry_at {
            qb.push(", retry_at = ").push_bind(retry_at.map(format_ts));
        }
        if let Some(completed_at) = update.completed_at {
            qb.push(", completed_at = ").push_bind(format_ts(completed_at));
        }
        if let Some(error) = update.error {
            qb.push(", error = ").push_bind(error);
        }
        if let Some(output) = update.output {
            qb.push(", output = ").push_bind(output);
        }
        if let Some(duration_ms) = update.duration_ms {
            qb.push(", duration_ms = ").push_bind(duration_ms as i64);
        }
        if let Some(pid) = update.worker_pid {
            qb.push(", worker_pid = ").push_bind(pid.map(i64::from));
        }

        qb.push(" WHERE id = ")
            .push_bind(id.as_str().to_string())
            .push(" RETURNING *");

        let row = qb
            .build_query_as::<JobRow>()
            .fetch_optional(self.pool())
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    /// Processing → Completed with captured output and duration.
    ///
    /// Only the worker currently holding the claim may complete the job. A
    /// worker whose claim was reaped and handed to someone else gets
    /// [`Error::ClaimLost`] and the row is left untouched.
    pub async fn mark_job_completed(
        &self,
        id: &JobId,
        worker_pid: u32,
        output: &str,
        duration: Duration,
    ) -> Result<Job> {
        let now = format_ts(Utc::now());
        let duration_ms = duration.as_millis() as i64;

        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE jobs
             SET state = 'completed', updated_at = ?, completed_at = ?, output = ?,
                 duration_ms = ?, retry_at = NULL, worker_pid = NULL
             WHERE id = ? AND state = 'processing' AND worker_pid = ?
             RETURNING *",
        )
        .bind(&now)
        .bind(&now)
        .bind(output)
        .bind(duration_ms)
        .bind(id.as_str())
        .bind(i64::from(worker_pid))
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Err(self
                .transition_error(id, worker_pid, JobState::Completed)
                .await);
        };

        record_transition(JobState::Processing, JobState::Completed);
        metrics::job_duration_ms().record(duration_ms as f64, &[KeyValue::new("result", "ok")]);

        row.try_into_job()
    }

    /// Record a failed attempt and apply the retry policy.
    ///
    /// `attempts` is the count including this failure. Below `max_retries`
    /// the job stays as `failed` with `retry_at = now + backoff_base^attempts`
    /// seconds; otherwise it moves to the dead-letter queue in one transaction.
    /// Like completion, this is guarded on `worker_pid` holding the claim.
    pub async fn mark_job_failed(
        &self,
        id: &JobId,
        worker_pid: u32,
        error: &str,
        attempts: u32,
        max_retries: u32,
    ) -> Result<RetryDecision> {
        let backoff_base = self.backoff_base().await?;
        let now = Utc::now();
        let decision = retry::decide(attempts, max_retries, backoff_base, now);

        match decision {
            RetryDecision::Retry {
                retry_at,
                delay_secs,
            } => {
                let updated = sqlx::query(
                    "UPDATE jobs
                     SET state = 'failed', attempts = ?, retry_at = ?, error = ?,
                         updated_at = ?, worker_pid = NULL
                     WHERE id = ? AND state = 'processing' AND worker_pid = ?",
                )
                .bind(i64::from(attempts))
                .bind(format_ts(retry_at))
                .bind(error)
                .bind(format_ts(now))
                .bind(id.as_str())
                .bind(i64::from(worker_pid))
                .execute(self.pool())
                .await?
                .rows_affected();

                if updated == 0 {
                    return Err(self
                        .transition_error(id, worker_pid, JobState::Failed)
                        .await);
                }

                record_transition(JobState::Processing, JobState::Failed);
                info!(job_id = %id, attempts, max_retries, delay_secs, "job scheduled for retry");
            }
            RetryDecision::DeadLetter => {
                let mut tx = self.pool().begin().await?;

                // Write first so the transaction takes the write lock up front.
                let moved = sqlx::query(
                    "INSERT OR REPLACE INTO dead_letter_queue (id, command, attempts, created_at, failed_at, error)
                     SELECT id, command, ?, created_at, ?, ? FROM jobs
                     WHERE id = ? AND state = 'processing' AND worker_pid = ?",
                )
                .bind(i64::from(attempts))
                .bind(format_ts(now))
                .bind(error)
                .bind(id.as_str())
                .bind(i64::from(worker_pid))
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if moved == 0 {
                    tx.rollback().await?;
                    return Err(self
                        .transition_error(id, worker_pid, JobState::Dead)
                        .await);
                }

                sqlx::query("DELETE FROM jobs WHERE id = ?")
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;

                record_transition(JobState::Processing, JobState::Dead);
                metrics::jobs_dead_lettered().add(1, &[]);
                info!(job_id = %id, attempts, max_retries, "job moved to dead-letter queue");
            }
        }

        Ok(decision)
    }

    /// List jobs, newest first. `None` lists every state.
    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>> {
        let state = state.map(JobState::as_str);
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs
             WHERE (? IS NULL OR state = ?)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ? OFFSET ?",
        )
        .bind(state)
        .bind(state)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    /// Totals per state. Dead jobs are counted from the dead-letter queue.
    pub async fn counts_by_state(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(self.pool())
                .await?;

        let mut counts = JobCounts::default();
        for (state, n) in rows {
            counts.set(state.parse()?, n as u64);
        }
        counts.dead = self.count_dlq().await?;
        Ok(counts)
    }

    /// Explain why a guarded transition matched no row.
    async fn transition_error(&self, id: &JobId, worker_pid: u32, to: JobState) -> Error {
        match self.get_job(id).await {
            Ok(Some(job)) if job.state == JobState::Processing => Error::ClaimLost {
                job: id.to_string(),
                pid: worker_pid,
            },
            Ok(Some(job)) => Error::InvalidTransition {
                from: job.state.to_string(),
                to: to.to_string(),
            },
            Ok(None) => Error::NotFound(format!("job {id}")),
            Err(e) => e,
        }
    }
}

fn record_transition(from: JobState, to: JobState) {
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(super) struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    created_at: String,
    updated_at: String,
    retry_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    output: Option<String>,
    duration_ms: Option<i64>,
    worker_pid: Option<i64>,
}

impl JobRow {
    pub(super) fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            command: self.command,
            state: self.state.parse()?,
            attempts: self.attempts as u32,
            max_retries: self.max_retries as u32,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            retry_at: self.retry_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            error: self.error,
            output: self.output,
            duration_ms: self.duration_ms.map(|ms| ms as u64),
            worker_pid: self.worker_pid.map(|pid| pid as u32),
        })
    }
}
