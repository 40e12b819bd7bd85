//! # Telemetry
//!
//! Structured logging is always on: [`init_telemetry`] installs a
//! `tracing-subscriber` registry with an `EnvFilter` (default `info`) and a
//! human-readable `fmt` layer.
//!
//! OpenTelemetry export is opt-in through cargo features:
//!
//! - `otel-tracing`: exports spans through `tracing-opentelemetry`.
//! - `otel-metrics`: exports the request counters and histograms below.
//! - `stdout`: exporter printing to stdout.
//! - `otlp`: OTLP/gRPC exporter, configured through the standard
//!   `OTEL_EXPORTER_OTLP_*` environment variables.
//!
//! Exporters require at least one of `otel-tracing` or `otel-metrics`. Both
//! exporters can be enabled at the same time.
//!
//! ```bash
//! cargo run --bin tandem-worker --features otel-tracing,stdout
//! ```
//!
//! The metric helpers at the bottom of this module compile to no-ops when
//! `otel-metrics` is disabled, so call sites never need a `cfg`.

#[cfg(all(feature = "otlp", not(any(feature = "otel-tracing", feature = "otel-metrics"))))]
compile_error!(
    "The 'otlp' feature requires at least one of 'otel-tracing' or 'otel-metrics' to be enabled."
);

#[cfg(all(feature = "stdout", not(any(feature = "otel-tracing", feature = "otel-metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'otel-tracing' or 'otel-metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "otel-metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "otel-metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "otel-metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
use opentelemetry_semantic_conventions as semcov;

#[cfg(feature = "otel-tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel-tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel-tracing")]
use opentelemetry_sdk::trace as sdktrace;

/// Handles to the exporters installed by [`init_telemetry`].
///
/// Keep it alive for the lifetime of the process and call
/// [`TelemetryProviders::shutdown`] on the way out to flush pending data.
pub struct TelemetryProviders {
    #[cfg(feature = "otel-tracing")]
    tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "otel-metrics")]
    meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down the exporters. Errors are reported on stderr
    /// because the subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "otel-tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "otel-metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs the global subscriber for a service binary.
pub fn init_telemetry(_service_name: &'static str) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel-tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel-tracing")]
    let tracer_provider = init_tracer(_service_name)?;

    #[cfg(feature = "otel-metrics")]
    let meter_provider = init_metrics(_service_name)?;

    #[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
    let scope = InstrumentationScope::builder("tandem")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semcov::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otel-tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "otel-metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel-tracing")]
        tracer_provider,
        #[cfg(feature = "otel-metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
fn resource(service_name: &'static str) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_schema_url(
            [KeyValue::new(
                semcov::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semcov::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "otel-metrics")]
fn init_metrics(service_name: &'static str) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel-tracing")]
fn init_tracer(service_name: &'static str) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::SpanExporter::default();
        builder.with_span_processor(sdktrace::BatchSpanProcessor::builder(exporter).build())
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(sdktrace::BatchSpanProcessor::builder(exporter).build())
    };

    Ok(builder.build())
}

#[cfg(feature = "otel-metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "otel-metrics")]
static REQUESTS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "otel-metrics")]
static COMMITS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "otel-metrics")]
static ROLLBACKS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "otel-metrics")]
static CANCELLATIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "otel-metrics")]
static REQUEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "otel-metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("Requests accepted")
            .build(),
    );
    let _ = REQUESTS_INFLIGHT.set(
        meter
            .i64_up_down_counter("requests_inflight")
            .with_description("Requests holding an open transaction")
            .build(),
    );
    let _ = COMMITS.set(
        meter
            .u64_counter("commits")
            .with_description("Transactions committed")
            .build(),
    );
    let _ = ROLLBACKS.set(
        meter
            .u64_counter("rollbacks")
            .with_description("Transactions rolled back")
            .build(),
    );
    let _ = CANCELLATIONS.set(
        meter
            .u64_counter("cancellations")
            .with_description("Cancellation signals observed")
            .build(),
    );
    let _ = REQUEST_DURATION_MS.set(
        meter
            .f64_histogram("request_duration")
            .with_unit("ms")
            .with_description("End-to-end request duration")
            .build(),
    );
}

#[cfg(feature = "otel-metrics")]
fn add(counter: &OnceLock<Counter<u64>>, service: &'static str) {
    if let Some(counter) = counter.get() {
        counter.add(1, &[KeyValue::new("service", service)]);
    }
}

#[cfg(feature = "otel-metrics")]
pub fn increment_requests(service: &'static str) {
    add(&REQUESTS, service);
}

#[cfg(not(feature = "otel-metrics"))]
pub fn increment_requests(_service: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn increment_commits(service: &'static str) {
    add(&COMMITS, service);
}

#[cfg(not(feature = "otel-metrics"))]
pub fn increment_commits(_service: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn increment_rollbacks(service: &'static str) {
    add(&ROLLBACKS, service);
}

#[cfg(not(feature = "otel-metrics"))]
pub fn increment_rollbacks(_service: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn increment_cancellations(service: &'static str) {
    add(&CANCELLATIONS, service);
}

#[cfg(not(feature = "otel-metrics"))]
pub fn increment_cancellations(_service: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn increment_inflight(service: &'static str) {
    if let Some(counter) = REQUESTS_INFLIGHT.get() {
        counter.add(1, &[KeyValue::new("service", service)]);
    }
}

#[cfg(not(feature = "otel-metrics"))]
pub fn increment_inflight(_service: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn decrement_inflight(service: &'static str) {
    if let Some(counter) = REQUESTS_INFLIGHT.get() {
        counter.add(-1, &[KeyValue::new("service", service)]);
    }
}

#[cfg(not(feature = "otel-metrics"))]
pub fn decrement_inflight(_service: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn record_request_duration(service: &'static str, duration_ms: f64) {
    if let Some(histogram) = REQUEST_DURATION_MS.get() {
        histogram.record(duration_ms, &[KeyValue::new("service", service)]);
    }
}

#[cfg(not(feature = "otel-metrics"))]
pub fn record_request_duration(_service: &'static str, _duration_ms: f64) {}

/// Tracks one in-flight request for the metrics above.
///
/// Increments the in-flight gauge on creation; on drop, decrements it and
/// records the elapsed time, whichever way the request ended.
pub struct InflightGuard {
    service: &'static str,
    start: std::time::Instant,
}

impl InflightGuard {
    pub fn new(service: &'static str) -> Self {
        increment_requests(service);
        increment_inflight(service);
        Self {
            service,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        decrement_inflight(self.service);
        record_request_duration(self.service, self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
