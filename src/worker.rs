//! Worker runtime: claim a job, run it, record the outcome, repeat.
//!
//! One worker per OS process. The poll loop and a heartbeat task run side by
//! side on the same runtime; cross-worker coordination happens only through
//! the database. Shutdown is checked at the top of each iteration, so an
//! in-flight command always finishes and is recorded before the loop exits.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::executor;
use crate::model::{Job, JobId, JobState};
use crate::retry::RetryDecision;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Worker timing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when nothing is eligible.
    pub poll_interval: Duration,
    /// How often `last_heartbeat` is refreshed.
    pub heartbeat_interval: Duration,
    /// Sleep after a storage error before polling again.
    pub error_backoff: Duration,
    /// Heartbeat age after which other workers' jobs are reclaimed.
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(2),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Cloneable stop request shared between signal handlers and the poll loop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop at its next checkpoint. Safe to call repeatedly.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if shutdown is requested.
    pub async fn sleep(&self, duration: Duration) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent request is not missed.
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = notified => {}
        }
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(Job),
    Retrying {
        job_id: JobId,
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        job_id: JobId,
        attempts: u32,
    },
    /// The claim was reaped and re-handed while the command ran. The result
    /// was discarded; the current holder records its own.
    ClaimLost { job_id: JobId },
}

/// A single worker bound to the current OS process.
pub struct Worker {
    db: Arc<Db>,
    config: WorkerConfig,
    pid: u32,
    shutdown: Shutdown,
}

impl Worker {
    pub fn new(db: Arc<Db>, config: WorkerConfig) -> Self {
        Self {
            db,
            config,
            pid: std::process::id(),
            shutdown: Shutdown::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Handle for requesting shutdown from another task.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Signal the worker to stop after the current job.
    pub fn shutdown(&self) {
        self.shutdown.request();
    }

    /// Run until shutdown is requested.
    ///
    /// Registers this process, heartbeats in the background, and polls for
    /// work. Storage errors inside the loop are logged and retried after
    /// `error_backoff`; only a shutdown request ends the loop. On exit the
    /// heartbeat stops and the registration is removed.
    pub async fn run(&self) -> Result<()> {
        self.db.register_worker(self.pid).await?;
        info!(pid = self.pid, "worker started");

        let heartbeat = self.spawn_heartbeat();

        while !self.shutdown.is_requested() {
            match self.process_next().await {
                Ok(Some(_)) => {}
                Ok(None) => self.shutdown.sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!(pid = self.pid, error = %e, "poll loop error, backing off");
                    self.shutdown.sleep(self.config.error_backoff).await;
                }
            }
        }

        info!(pid = self.pid, "worker stopping");
        heartbeat.abort();
        let _ = heartbeat.await;

        if let Err(e) = self.db.unregister_worker(self.pid).await {
            warn!(pid = self.pid, error = %e, "failed to unregister worker");
        }

        info!(pid = self.pid, "worker stopped");
        Ok(())
    }

    /// One claim, execute, record cycle. `None` if nothing was eligible.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>> {
        let Some(job) = self.db.claim_next_job(self.pid).await? else {
            return Ok(None);
        };

        let span = start_job_span(&job.id, self.pid);
        let outcome = self
            .execute_claimed(&job, &span)
            .instrument(span.clone())
            .await?;

        Ok(Some(outcome))
    }

    async fn execute_claimed(&self, job: &Job, span: &Span) -> Result<JobOutcome> {
        record_state_transition(span, claimed_from(job).as_str(), "processing");
        info!(job_id = %job.id, command = %job.command, attempts = job.attempts, "processing job");

        let result = executor::execute(&job.command).await;
        let duration_ms = result.duration.as_millis() as u64;

        if result.success {
            let output = result.combined_output();
            let done = match self
                .db
                .mark_job_completed(&job.id, self.pid, &output, result.duration)
                .await
            {
                Ok(done) => done,
                Err(e @ Error::ClaimLost { .. }) => return Ok(self.claim_lost(job, &e)),
                Err(e) => return Err(e),
            };
            record_state_transition(span, "processing", "completed");
            info!(job_id = %job.id, duration_ms, "job completed");
            return Ok(JobOutcome::Completed(done));
        }

        let attempts = job.attempts + 1;
        let message = result.failure_message();
        metrics::job_duration_ms().record(duration_ms as f64, &[KeyValue::new("result", "failed")]);
        warn!(
            job_id = %job.id,
            exit_code = ?result.exit_code,
            attempts,
            max_retries = job.max_retries,
            error = %message,
            "job failed"
        );

        let decision = match self
            .db
            .mark_job_failed(&job.id, self.pid, &message, attempts, job.max_retries)
            .await
        {
            Ok(decision) => decision,
            Err(e @ Error::ClaimLost { .. }) => return Ok(self.claim_lost(job, &e)),
            Err(e) => return Err(e),
        };

        Ok(match decision {
            RetryDecision::Retry { retry_at, .. } => {
                record_state_transition(span, "processing", "failed");
                JobOutcome::Retrying {
                    job_id: job.id.clone(),
                    attempts,
                    retry_at,
                }
            }
            RetryDecision::DeadLetter => {
                record_state_transition(span, "processing", "dead");
                JobOutcome::DeadLettered {
                    job_id: job.id.clone(),
                    attempts,
                }
            }
        })
    }

    fn claim_lost(&self, job: &Job, e: &Error) -> JobOutcome {
        warn!(job_id = %job.id, pid = self.pid, error = %e, "discarding result of reclaimed job");
        JobOutcome::ClaimLost {
            job_id: job.id.clone(),
        }
    }

    /// Refresh this worker's heartbeat and reap dead peers until aborted.
    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let db = Arc::clone(&self.db);
        let pid = self.pid;
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; registration just stamped the heartbeat.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match db.heartbeat(pid).await {
                    Ok(true) => debug!(pid, "heartbeat"),
                    Ok(false) if !shutdown.is_requested() => {
                        warn!(pid, "registration missing, re-registering");
                        if let Err(e) = db.register_worker(pid).await {
                            warn!(pid, error = %e, "re-registration failed");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(pid, error = %e, "heartbeat failed"),
                }

                if let Err(e) = db.reap_stale_workers(config.stale_after).await {
                    warn!(pid, error = %e, "stale worker reaping failed");
                }
            }
        })
    }
}

/// Failed jobs always carry `retry_at`; pending ones never do.
fn claimed_from(job: &Job) -> JobState {
    if job.retry_at.is_some() {
        JobState::Failed
    } else {
        JobState::Pending
    }
}
