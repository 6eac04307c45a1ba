//! Logging and OpenTelemetry initialization.
//!
//! Every process logs to stderr through `tracing-subscriber`. Spawned workers
//! have stderr redirected to the shared log file. With an OTLP endpoint the
//! same events, plus spans and metrics, are also exported.

pub mod job;
pub mod metrics;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`. `None` logs locally only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Keeps the export pipelines alive. Dropping it flushes and shuts them down.
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

impl TelemetryGuard {
    /// Push buffered spans, metrics, and logs to the collector now.
    pub fn force_flush(&self) {
        if let Some(ref pipelines) = self.pipelines {
            pipelines.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(pipelines) = self.pipelines.take() {
            pipelines.shutdown();
        }
    }
}

/// Install the global subscriber (and meter provider when exporting).
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// set, which happens when several tests in one binary initialize telemetry.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr),
    );

    let Some(endpoint) = config.endpoint else {
        registry.try_init().map_err(subscriber_error)?;
        return Ok(TelemetryGuard { pipelines: None });
    };

    let pipelines = Pipelines::build(&endpoint, config.service_name)?;
    opentelemetry::global::set_meter_provider(pipelines.metrics.clone());

    registry
        .with(tracing_opentelemetry::layer().with_tracer(pipelines.traces.tracer("queuectl")))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&pipelines.logs))
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        pipelines: Some(pipelines),
    })
}

/// The three OTLP providers, sharing one resource.
struct Pipelines {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl Pipelines {
    fn build(endpoint: &str, service_name: String) -> Result<Self> {
        use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig as _};

        let resource = Resource::builder()
            .with_service_name(service_name)
            .with_attribute(KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ))
            .build();

        let spans = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let metrics = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let logs = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;

        Ok(Self {
            traces: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            metrics: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logs: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }

    fn force_flush(&self) {
        let _ = self.traces.force_flush();
        let _ = self.metrics.force_flush();
        let _ = self.logs.force_flush();
    }

    // Logs first so events emitted while spans close still go out.
    fn shutdown(self) {
        let _ = self.logs.shutdown();
        let _ = self.metrics.shutdown();
        let _ = self.traces.shutdown();
    }
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exporters connect lazily, so building needs no collector.
    #[tokio::test(flavor = "multi_thread")]
    async fn pipelines_build_and_shut_down_without_a_collector() {
        let pipelines = Pipelines::build("http://127.0.0.1:4317", "queuectl-test".to_string())
            .expect("exporters should build without connecting");
        pipelines.force_flush();
        pipelines.shutdown();
    }

    #[test]
    fn exporter_errors_name_the_signal() {
        let err = exporter_error("metric")("bad endpoint");
        assert!(err.to_string().contains("OTLP metric exporter: bad endpoint"));
    }
}
