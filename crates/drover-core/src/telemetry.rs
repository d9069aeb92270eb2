//! Tracing bootstrap with optional OpenTelemetry export.
//!
//! Every Drover binary calls [`init_telemetry`] once at startup. Console
//! output goes through `tracing-subscriber`; with the `telemetry` feature and
//! `enabled = true`, spans are also exported over OTLP.

#[cfg(feature = "telemetry")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "telemetry")]
use opentelemetry::KeyValue;
#[cfg(feature = "telemetry")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "telemetry")]
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler},
    Resource,
};
#[cfg(feature = "telemetry")]
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

use crate::{DroverError, DroverResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether OpenTelemetry export is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Service name for tracing.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP endpoint URL (e.g., "http://localhost:4317").
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Sampling ratio (0.0 to 1.0).
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,

    /// Whether to enable console output.
    #[serde(default = "default_console_output")]
    pub console_output: bool,

    /// Console format: `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_service_name() -> String {
    "drover".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_console_output() -> bool {
    true
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_filter() -> String {
    "info,drover=debug".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
            otlp_endpoint: None,
            sampling_ratio: default_sampling_ratio(),
            console_output: default_console_output(),
            log_format: default_log_format(),
            log_filter: default_log_filter(),
        }
    }
}

impl TelemetryConfig {
    /// Returns true when console output should be JSON lines.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_filter))
    }
}

/// Installs the global subscriber.
///
/// Console output follows `log_format`. With `enabled = true` an
/// OpenTelemetry layer is added; spans go to `otlp_endpoint` when set and
/// are only sampled in-process otherwise.
#[cfg(feature = "telemetry")]
pub fn init_telemetry(config: &TelemetryConfig) -> DroverResult<()> {
    if !config.enabled {
        return init_basic_tracing(config);
    }

    let provider = build_tracer_provider(config)?;
    let tracer = provider.tracer("drover");
    opentelemetry::global::set_tracer_provider(provider);

    let console = config.console_output;
    let json = config.is_json();

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with((console && json).then(|| tracing_subscriber::fmt::layer().json().with_target(true)))
        .with((console && !json).then(|| tracing_subscriber::fmt::layer().with_target(true)))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .map_err(|e| DroverError::Telemetry(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        ratio = config.sampling_ratio,
        endpoint = ?config.otlp_endpoint,
        "OpenTelemetry export enabled"
    );
    Ok(())
}

#[cfg(feature = "telemetry")]
fn sampler_for(ratio: f64) -> Sampler {
    match ratio {
        r if r >= 1.0 => Sampler::AlwaysOn,
        r if r <= 0.0 => Sampler::AlwaysOff,
        r => Sampler::TraceIdRatioBased(r),
    }
}

#[cfg(feature = "telemetry")]
fn build_tracer_provider(
    config: &TelemetryConfig,
) -> DroverResult<opentelemetry_sdk::trace::TracerProvider> {
    let mut builder = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_sampler(sampler_for(config.sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new([KeyValue::new(
            SERVICE_NAME,
            config.service_name.clone(),
        )]));

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| DroverError::Telemetry(format!("OTLP exporter for {}: {}", endpoint, e)))?;
        builder = builder.with_batch_exporter(exporter, runtime::Tokio);
    }

    Ok(builder.build())
}

/// Initialize console tracing only.
#[cfg(not(feature = "telemetry"))]
pub fn init_telemetry(config: &TelemetryConfig) -> DroverResult<()> {
    if config.enabled {
        tracing::warn!("OpenTelemetry export requested but the `telemetry` feature is disabled");
    }
    init_basic_tracing(config)
}

fn init_basic_tracing(config: &TelemetryConfig) -> DroverResult<()> {
    if !config.console_output {
        return Ok(());
    }

    let json = config.is_json();

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_target(true)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(true)))
        .try_init()
        .map_err(|e| DroverError::Telemetry(e.to_string()))
}

/// Shutdown telemetry, flushing any pending spans.
#[cfg(feature = "telemetry")]
pub fn shutdown_telemetry() {
    tracing::debug!("Flushing pending spans");
    opentelemetry::global::shutdown_tracer_provider();
}

/// No spans are buffered without the `telemetry` feature.
#[cfg(not(feature = "telemetry"))]
pub fn shutdown_telemetry() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.service_name, "drover");
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(config.console_output);
        assert!(!config.is_json());
    }

    #[test]
    fn test_json_format_detection() {
        let config = TelemetryConfig {
            log_format: "JSON".to_string(),
            ..Default::default()
        };
        assert!(config.is_json());
    }

    #[cfg(feature = "telemetry")]
    #[test]
    fn test_sampler_ratio_bounds() {
        assert!(matches!(sampler_for(1.5), Sampler::AlwaysOn));
        assert!(matches!(sampler_for(0.0), Sampler::AlwaysOff));
        assert!(matches!(sampler_for(0.25), Sampler::TraceIdRatioBased(r) if r == 0.25));
    }

    #[test]
    fn test_silent_init_is_noop() {
        let config = TelemetryConfig {
            console_output: false,
            ..Default::default()
        };
        assert!(init_basic_tracing(&config).is_ok());
    }
}
