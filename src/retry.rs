//! Retry and dead-letter policy.
//!
//! Pure decision logic: given how many attempts a job has burned, its
//! budget, and the backoff base, decide whether it runs again or dies.

use chrono::{DateTime, Duration, Utc};

/// Upper bound on a single retry delay (one week).
pub const MAX_BACKOFF_SECS: u64 = 7 * 24 * 60 * 60;

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Stay in the jobs table as `failed`, claimable again at `retry_at`.
    Retry {
        retry_at: DateTime<Utc>,
        delay_secs: u64,
    },
    /// Budget exhausted. Move to the dead-letter queue.
    DeadLetter,
}

impl RetryDecision {
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, RetryDecision::DeadLetter)
    }
}

/// Delay before the next attempt: `base ^ attempts` seconds, capped at [`MAX_BACKOFF_SECS`].
pub fn backoff_delay(backoff_base: u32, attempts: u32) -> u64 {
    u64::from(backoff_base)
        .checked_pow(attempts)
        .map_or(MAX_BACKOFF_SECS, |secs| secs.min(MAX_BACKOFF_SECS))
}

/// Decide the fate of a job whose attempt count is now `attempts`.
pub fn decide(
    attempts: u32,
    max_retries: u32,
    backoff_base: u32,
    now: DateTime<Utc>,
) -> RetryDecision {
    if attempts >= max_retries {
        return RetryDecision::DeadLetter;
    }

    let delay_secs = backoff_delay(backoff_base, attempts);
    RetryDecision::Retry {
        retry_at: now + Duration::seconds(delay_secs as i64),
        delay_secs,
    }
}
