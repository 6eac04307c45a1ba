//! Job execution span helpers.

use tracing::Span;

use crate::model::JobId;

/// Start a span covering one claimed job on one worker.
///
/// The `job.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(job_id: &JobId, worker_pid: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job_id,
        "worker.pid" = worker_pid,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
