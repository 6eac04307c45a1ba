//! Metric instrument factories for queuectl.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"queuectl"` meter, so they
//! are no-ops until telemetry export is configured.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for queuectl instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("queuectl")
}

/// Counter: jobs accepted into the queue.
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("queuectl.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "empty").
pub fn job_claims() -> Counter<u64> {
    meter()
        .u64_counter("queuectl.jobs.claims")
        .with_description("Number of claim attempts by workers")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("queuectl.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: jobs moved to the dead-letter queue.
pub fn jobs_dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("queuectl.jobs.dead_lettered")
        .with_description("Number of jobs moved to the dead-letter queue")
        .build()
}

/// Histogram: command execution duration in milliseconds.
/// Labels: `result` ("ok" | "failed").
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("queuectl.job.duration_ms")
        .with_description("Job command duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: stale worker registrations removed by the reaper.
pub fn workers_reaped() -> Counter<u64> {
    meter()
        .u64_counter("queuectl.workers.reaped")
        .with_description("Number of stale workers reaped")
        .build()
}
