use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{self, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::util::env::Var;
use crate::var;

pub type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>;

const ENV_FILTER: &str = "podium_server=debug,tower_http=debug,axum=debug,sqlx=info,info";

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub tracer_name: &'static str,
    pub base_resource: Resource,
    pub collector_url: &'static str,

    providers: Providers,
}

/// Stdout is the development fallback when no collector endpoint is
/// configured; spans still flow, just to the console.
#[derive(Debug, Clone)]
enum Providers {
    Otlp {
        logger: SdkLoggerProvider,
        tracer: SdkTracerProvider,
        meter: SdkMeterProvider,
    },
    Stdout {
        tracer: SdkTracerProvider,
    },
}

impl Telemetry {
    pub async fn new() -> Result<Telemetry> {
        let collector_url = var!(Var::OtelExporterEndpoint).await?;
        let tracer_name = var!(Var::ServiceName).await?;
        let service_version = env!("CARGO_PKG_VERSION");

        let base_resource = base_attrs(tracer_name, service_version);

        let providers = if collector_url.is_empty() {
            Providers::Stdout {
                tracer: build_stdout_provider(),
            }
        } else {
            Providers::Otlp {
                logger: build_logger_provider(collector_url, base_resource.clone())?,
                tracer: build_tracer_provider(collector_url, base_resource.clone())?,
                meter: build_meter_provider(collector_url, base_resource.clone())?,
            }
        };

        Ok(Self {
            base_resource,
            tracer_name,
            collector_url,
            providers,
        })
    }

    pub fn register(self) -> Self {
        match &self.providers {
            Providers::Otlp {
                logger,
                tracer,
                meter,
            } => {
                global::set_tracer_provider(tracer.clone());
                let trace_layer = tracing_opentelemetry::layer()
                    .with_tracer(tracer.tracer(self.tracer_name));

                let log_layer = OpenTelemetryTracingBridge::new(logger);
                let meter_layer = tracing_opentelemetry::MetricsLayer::new(meter.clone());

                tracing_subscriber::registry()
                    .with(trace_layer)
                    .with(log_layer)
                    .with(meter_layer)
                    .with(EnvFilter::new(ENV_FILTER))
                    .with(build_fmt_layer())
                    .init();
            }
            Providers::Stdout { tracer } => {
                global::set_tracer_provider(tracer.clone());
                let trace_layer = tracing_opentelemetry::layer()
                    .with_tracer(tracer.tracer(self.tracer_name));

                tracing_subscriber::registry()
                    .with(trace_layer)
                    .with(EnvFilter::new(ENV_FILTER))
                    .with(build_fmt_layer())
                    .init();
            }
        }

        self
    }

    pub fn shutdown(self) {
        match self.providers {
            Providers::Otlp {
                logger,
                tracer,
                meter,
            } => {
                if let Err(e) = meter.shutdown() {
                    eprintln!("error during metering shutdown: {e:?}");
                }
                if let Err(e) = logger.shutdown() {
                    eprintln!("error during logging shutdown: {e:?}");
                }
                if let Err(e) = tracer.shutdown() {
                    eprintln!("error during tracing shutdown: {e:?}");
                }
            }
            Providers::Stdout { tracer } => {
                if let Err(e) = tracer.shutdown() {
                    eprintln!("error during tracing shutdown: {e:?}");
                }
            }
        }
    }
}

pub fn build_logger_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Logs.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource.clone())
        .build())
}

pub fn build_tracer_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Traces.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource.clone())
        .build())
}

pub fn build_meter_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Metrics.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(base_resource.clone())
        .build())
}

// each registry stack needs its own monomorphization, so the fmt layer is
// built at the call site rather than shared across the match arms
fn build_fmt_layer<S>() -> tracing_subscriber::fmt::Layer<S> {
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
}

fn build_stdout_provider() -> SdkTracerProvider {
    let exporter = opentelemetry_stdout::SpanExporter::default();
    SdkTracerProvider::builder()
        .with_simple_exporter(exporter)
        .with_id_generator(RandomIdGenerator::default())
        .with_sampler(Sampler::AlwaysOn)
        .build()
}

fn base_attrs(name: &'static str, version: &'static str) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", name),
            KeyValue::new("service.version", version),
        ])
        .build()
}

enum Endpoint {
    Logs,
    Traces,
    Metrics,
}

impl Endpoint {
    pub fn to_url(&self, collector_endpoint: &str) -> String {
        let location: &str = match self {
            Endpoint::Logs => "/v1/logs",
            Endpoint::Traces => "/v1/traces",
            Endpoint::Metrics => "/v1/metrics",
        };
        format!("{collector_endpoint}{location}")
    }
}
