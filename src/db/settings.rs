//! Queue-wide settings in the `config` table.
//!
//! Reads always hit the table, so a value set by one process is seen by
//! every other process on its next read.

use chrono::Utc;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{ConfigKey, format_ts};

impl super::Db {
    /// Raw stored value for `key`, or `default` when unset.
    pub async fn get_config(&self, key: ConfigKey, default: &str) -> Result<String> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(self.pool())
            .await?;

        Ok(value.map_or_else(|| default.to_string(), |(v,)| v))
    }

    /// Store `value` for `key`. Values must be positive integers.
    pub async fn set_config(&self, key: ConfigKey, value: &str) -> Result<()> {
        let parsed = parse_positive(key, value)?;

        sqlx::query("INSERT OR REPLACE INTO config (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(key.as_str())
            .bind(parsed.to_string())
            .bind(format_ts(Utc::now()))
            .execute(self.pool())
            .await?;

        info!(key = %key, value = parsed, "config updated");
        Ok(())
    }

    /// Typed read with the built-in default.
    pub async fn config_value(&self, key: ConfigKey) -> Result<u32> {
        let default = key.default_value();
        let raw = self.get_config(key, &default.to_string()).await?;
        raw.trim()
            .parse()
            .map_err(|_| Error::Config(format!("stored {key} is not a number: {raw}")))
    }

    /// Current default retry budget for new jobs.
    pub async fn max_retries(&self) -> Result<u32> {
        self.config_value(ConfigKey::MaxRetries).await
    }

    /// Current backoff base in seconds.
    pub async fn backoff_base(&self) -> Result<u32> {
        self.config_value(ConfigKey::BackoffBase).await
    }
}

fn parse_positive(key: ConfigKey, value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(Error::Validation(format!(
            "{key} must be a positive number, got '{value}'"
        ))),
    }
}
