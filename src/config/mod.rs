//! Typed process configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. Queue-wide
//! tunables shared by every process (`max-retries`, `backoff-base`) live in
//! the database instead; see `Db::get_config`.

use crate::error::{Error, Result};
use crate::worker::WorkerConfig;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "data/jobs.db";
pub const DEFAULT_LOG_FILE: &str = "logs/queuectl.log";

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file shared by the CLI and all workers.
    pub db_path: PathBuf,
    /// Where spawned workers append their log output.
    pub log_file: PathBuf,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub error_backoff: Duration,
    /// Heartbeat age after which a worker is presumed dead.
    pub stale_after: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_path: std::env::var("QUEUECTL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH)),
            log_file: std::env::var("QUEUECTL_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_FILE)),
            poll_interval: millis_var("QUEUECTL_POLL_INTERVAL_MS", 1_000)?,
            heartbeat_interval: millis_var("QUEUECTL_HEARTBEAT_INTERVAL_MS", 5_000)?,
            error_backoff: millis_var("QUEUECTL_ERROR_BACKOFF_MS", 2_000)?,
            stale_after: Duration::from_secs(number_var("QUEUECTL_STALE_AFTER_SECS", 30)?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Worker runtime settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            error_backoff: self.error_backoff,
            stale_after: self.stale_after,
        }
    }
}

fn millis_var(name: &str, default: u64) -> Result<Duration> {
    number_var(name, default).map(Duration::from_millis)
}

fn number_var(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            Error::Config(format!("environment variable {name} must be a number, got '{raw}'"))
        }),
        Err(_) => Ok(default),
    }
}
