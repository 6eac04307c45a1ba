//! Core data model.
//!
//! A job is a shell command plus its lifecycle state. Jobs that exhaust
//! their retry budget leave the jobs table and become dead-letter entries.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, caller-supplied or generated.
    pub id: JobId,

    /// Shell command to run. Immutable after creation.
    pub command: String,

    /// Current lifecycle state.
    pub state: JobState,

    /// Failed execution attempts so far.
    pub attempts: u32,

    /// Attempts allowed before the job is dead-lettered.
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When a failed job becomes claimable again.
    pub retry_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Last failure message.
    pub error: Option<String>,

    /// Captured output of the successful run.
    pub output: Option<String>,

    /// Wall-clock duration of the last run.
    pub duration_ms: Option<u64>,

    /// Worker process currently holding the job (only while processing).
    pub worker_pid: Option<u32>,
}

/// Opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Ran successfully. Terminal.
    Completed,
    /// Last run failed, retry scheduled via `retry_at`.
    Failed,
    /// Retry budget exhausted, lives in the dead-letter queue. Terminal.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            _ => Err(Error::Validation(format!("unknown job state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Dead letters, workers, counts
// ---------------------------------------------------------------------------

/// A job that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: JobId,
    pub command: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Liveness record of one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Job totals per state. `dead` counts dead-letter entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }

    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub(crate) fn set(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending = n,
            JobState::Processing => self.processing = n,
            JobState::Completed => self.completed = n,
            JobState::Failed => self.failed = n,
            JobState::Dead => self.dead = n,
        }
    }
}

// ---------------------------------------------------------------------------
// Config keys
// ---------------------------------------------------------------------------

/// Queue-wide tunables stored in the config table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// Default retry budget captured by new jobs.
    MaxRetries,
    /// Exponent base (seconds) for retry delay.
    BackoffBase,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 2] = [ConfigKey::MaxRetries, ConfigKey::BackoffBase];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max-retries",
            ConfigKey::BackoffBase => "backoff-base",
        }
    }

    pub fn default_value(self) -> u32 {
        match self {
            ConfigKey::MaxRetries => 3,
            ConfigKey::BackoffBase => 2,
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ConfigKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max-retries" => Ok(ConfigKey::MaxRetries),
            "backoff-base" => Ok(ConfigKey::BackoffBase),
            _ => Err(Error::Validation(format!(
                "unknown config key '{s}', expected one of: max-retries, backoff-base"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Input for creating a job. Deserializes from `{"command": ..., "id"?: ..., "max_retries"?: ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub(crate) command: String,
    #[serde(default)]
    pub(crate) id: Option<String>,
    #[serde(default)]
    pub(crate) max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            id: None,
            max_retries: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Reject inputs that can never become a runnable job.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::Validation("command cannot be empty".to_string()));
        }
        if self.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(Error::Validation("job id cannot be empty".to_string()));
        }
        if self.max_retries == Some(0) {
            return Err(Error::Validation(
                "max_retries must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Fixed-width UTC text so SQL string comparison matches time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::seconds(10);
        assert!(format_ts(a) < format_ts(b));
        assert!(format_ts(b) < format_ts(c));
        assert_eq!(format_ts(a).len(), format_ts(c).len());
    }

    #[test]
    fn timestamp_round_trips_at_micro_precision() {
        let now = Utc::now();
        let parsed = parse_ts(&format_ts(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn state_parses_and_displays() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn new_job_rejects_blank_command() {
        assert!(NewJob::new("   ").validate().is_err());
        assert!(NewJob::new("echo ok").max_retries(0).validate().is_err());
        assert!(NewJob::new("echo ok").id("").validate().is_err());
        assert!(NewJob::new("echo ok").validate().is_ok());
    }

    #[test]
    fn new_job_deserializes_from_json() {
        let new: NewJob =
            serde_json::from_str(r#"{"id":"job1","command":"sleep 2","max_retries":4}"#).unwrap();
        assert_eq!(new.id.as_deref(), Some("job1"));
        assert_eq!(new.command, "sleep 2");
        assert_eq!(new.max_retries, Some(4));
    }
}
