use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;
use serde::Deserialize;
use std::time::Duration;

const EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Http,
    Grpc,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_export_interval_secs")]
    pub export_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            transport: Transport::default(),
            endpoint: default_endpoint(),
            export_interval_secs: default_export_interval_secs(),
        }
    }
}

fn default_endpoint() -> String {
    "http://localhost:8428/opentelemetry/v1/metrics".into()
}

fn default_export_interval_secs() -> u64 {
    30
}

fn build_exporter(config: &MetricsConfig) -> Option<MetricExporter> {
    let built = match config.transport {
        Transport::Grpc => MetricExporter::builder()
            .with_tonic()
            .with_endpoint(&config.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_timeout(EXPORT_TIMEOUT)
            .build(),
        Transport::Http => MetricExporter::builder()
            .with_http()
            .with_endpoint(&config.endpoint)
            .with_protocol(Protocol::HttpBinary)
            .with_timeout(EXPORT_TIMEOUT)
            .build(),
    };
    built
        .map_err(|e| log::warn!("metrics exporter ({:?}): {e}", config.transport))
        .ok()
}

/// Build and register the global meter provider; `None` when disabled or the
/// exporter cannot be built. gRPC needs an active tokio runtime.
pub fn init_meter_provider(config: &MetricsConfig) -> Option<SdkMeterProvider> {
    if !config.enabled {
        return None;
    }
    let reader = PeriodicReader::builder(build_exporter(config)?)
        .with_interval(Duration::from_secs(config.export_interval_secs.max(1)))
        .build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(
            Resource::builder_empty()
                .with_attributes([KeyValue::new("service.name", "tracemem")])
                .build(),
        )
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    log::info!("metrics export to {} every {}s", config.endpoint, config.export_interval_secs);
    Some(provider)
}

/// Count a queue state transition. A no-op until a provider is installed.
pub fn record_job(transition: &'static str, n: u64) {
    if n == 0 {
        return;
    }
    opentelemetry::global::meter("tracemem")
        .u64_counter("tracemem_jobs_total")
        .build()
        .add(n, &[KeyValue::new("transition", transition)]);
}

pub fn record_replication(kind: &'static str, outcome: &'static str) {
    opentelemetry::global::meter("tracemem")
        .u64_counter("tracemem_replication_total")
        .build()
        .add(
            1,
            &[KeyValue::new("kind", kind), KeyValue::new("outcome", outcome)],
        );
}
