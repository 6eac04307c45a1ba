//! Integration tests for telemetry initialization and span helpers.

use queuectl::model::JobId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so a second
    // initialization in the same binary may return Err; that is acceptable.
    let config = queuectl::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "queuectl-test".to_string(),
        log_level: "warn".to_string(),
    };
    let _guard = queuectl::telemetry::init_telemetry(config);
}

#[test]
fn job_span_creates_and_records_transition() {
    let id = JobId::generate();
    let span = queuectl::telemetry::job::start_job_span(&id, std::process::id());
    queuectl::telemetry::job::record_state_transition(&span, "pending", "processing");
    queuectl::telemetry::job::record_state_transition(&span, "processing", "completed");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;
    use queuectl::telemetry::metrics;

    metrics::jobs_enqueued().add(1, &[]);
    metrics::job_claims().add(1, &[KeyValue::new("result", "empty")]);
    metrics::job_duration_ms().record(12.0, &[KeyValue::new("result", "ok")]);
    metrics::workers_reaped().add(0, &[]);
}
