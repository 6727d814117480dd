//! Observability: structured logging, OTLP tracing export and metrics.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the tracing stack.
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Set up OpenTelemetry tracing if endpoint is provided
    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let json_layer = config
        .json_logging
        .then(|| tracing_subscriber::fmt::layer().json());
    let pretty_layer = (!config.json_logging).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(telemetry_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    Ok(())
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Install the global Prometheus recorder and describe every metric.
pub fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    self::metrics::register_metrics();
    Ok(handle)
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_gauge, gauge};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!(
            "modelsync_requests_total",
            "Requests handled by the messenger, by entity type and method"
        );
        describe_counter!(
            "modelsync_database_calls_total",
            "Calls issued to the database, by kind"
        );
        describe_counter!(
            "modelsync_coalesced_reads_total",
            "Reads served by an already in-flight database read"
        );
        describe_counter!(
            "modelsync_change_events_total",
            "Change events published, by entity type"
        );
        describe_counter!(
            "modelsync_lagging_connections_total",
            "Connections closed because their outbound queue was full"
        );
        describe_counter!(
            "modelsync_errors_total",
            "Errors surfaced to clients, by code"
        );

        describe_gauge!(
            "modelsync_cached_models",
            "Models currently held in the messenger cache"
        );
        describe_gauge!(
            "modelsync_connections",
            "Open client connections"
        );
    }

    pub fn record_request(entity_type: &str, method: &str) {
        counter!(
            "modelsync_requests_total",
            "entity" => entity_type.to_string(),
            "method" => method.to_string(),
        )
        .increment(1);
    }

    pub fn record_database_call(kind: &'static str) {
        counter!("modelsync_database_calls_total", "kind" => kind).increment(1);
    }

    pub fn record_coalesced_read() {
        counter!("modelsync_coalesced_reads_total").increment(1);
    }

    pub fn record_change_event(entity_type: &str) {
        counter!("modelsync_change_events_total", "entity" => entity_type.to_string()).increment(1);
    }

    pub fn record_lagging_connection() {
        counter!("modelsync_lagging_connections_total").increment(1);
    }

    pub fn set_cached_models(count: usize) {
        gauge!("modelsync_cached_models").set(count as f64);
    }

    pub fn set_connections(count: usize) {
        gauge!("modelsync_connections").set(count as f64);
    }
}
