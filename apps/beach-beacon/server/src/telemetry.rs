use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-beacon";

/// Metric names shared by the request handlers and the stream guard.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beach_beacon_connections_total";
    pub const CONNECTIONS_CLOSED: &str = "beach_beacon_connections_closed_total";
    pub const CONNECTIONS_ACTIVE: &str = "beach_beacon_connections_active";
    pub const POLLS_TOTAL: &str = "beach_beacon_polls_total";
    pub const EVENTS_PUBLISHED: &str = "beach_beacon_events_published_total";
    pub const DELIVERIES_TOTAL: &str = "beach_beacon_deliveries_total";
    pub const EVICTIONS_TOTAL: &str = "beach_beacon_evictions_total";
    pub const BROADCAST_FANOUT: &str = "beach_beacon_broadcast_fanout";
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub log_filter: String,
    pub otel_stdout: bool,
}

/// Process-wide logging, tracing and metrics setup. Keep it alive for the
/// lifetime of the server; dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(config: &TelemetryConfig) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directives) if !directives.trim().is_empty() => log_filter(&directives)
                .with_context(|| format!("invalid {}", EnvFilter::DEFAULT_ENV))?,
            _ => log_filter(&config.log_filter)?,
        };

        let tracer_provider = config.otel_stdout.then(stdout_tracer_provider);
        let otel_layer = tracer_provider
            .as_ref()
            .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if let Some(provider) = &tracer_provider {
            global::set_tracer_provider(provider.clone());
            info!("OpenTelemetry stdout exporter enabled");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

pub fn log_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).with_context(|| format!("invalid log filter: {directives}"))
}
