//! Logging and tracing bootstrap
//!
//! Structured logging through `tracing` is always on. With the `otel`
//! feature, spans are exported over OTLP and registry metrics are recorded
//! into a Prometheus registry held by the returned guard.

use crate::error::{Error, Result};

const SERVICE_NAME_DEFAULT: &str = "actuary";
const LOG_FILTER_DEFAULT: &str = "info";

/// How the process reports what it does
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `service.name` resource attribute
    pub service_name: String,
    /// Registry instance identifier, attached to every exported span
    pub instance: Option<String>,
    /// `EnvFilter` directives (`RUST_LOG` syntax)
    pub log_filter: String,
    /// Emit human-readable logs on stdout
    pub stdout_enabled: bool,
    /// OTLP collector (e.g. `http://localhost:4317`)
    pub otlp_endpoint: Option<String>,
    /// Record registry metrics into a Prometheus registry
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME_DEFAULT.to_string(),
            instance: None,
            log_filter: LOG_FILTER_DEFAULT.to_string(),
            stdout_enabled: true,
            otlp_endpoint: None,
            metrics_enabled: false,
        }
    }
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_log_level(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_metrics(mut self) -> Self {
        self.metrics_enabled = true;
        self
    }

    pub fn without_stdout(mut self) -> Self {
        self.stdout_enabled = false;
        self
    }

    /// Defaults overridden from the process environment
    ///
    /// See `apply_env` for the variables read.
    pub fn from_env() -> Self {
        Self::default().apply_env(|name| std::env::var(name).ok())
    }

    /// Override fields from `lookup`
    ///
    /// - `OTEL_SERVICE_NAME`
    /// - `ACTUARY_INSTANCE`
    /// - `RUST_LOG`
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`
    /// - `METRICS_ENABLED` (`true`/`false`; unparsable values are ignored)
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(name) = present("OTEL_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Some(instance) = present("ACTUARY_INSTANCE") {
            self.instance = Some(instance);
        }
        if let Some(filter) = present("RUST_LOG") {
            self.log_filter = filter;
        }
        if let Some(endpoint) = present("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.otlp_endpoint = Some(endpoint);
        }
        if let Some(enabled) = present("METRICS_ENABLED").and_then(|v| v.parse().ok()) {
            self.metrics_enabled = enabled;
        }
        self
    }
}

fn env_filter(config: &TelemetryConfig) -> Result<tracing_subscriber::EnvFilter> {
    tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .map_err(|e| Error::invalid_config("telemetry.log_filter", e.to_string()))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::internal(format!("tracing subscriber already set: {}", e))
}

// =============================================================================
// With OpenTelemetry
// =============================================================================

/// Keeps exporters alive; flushes spans on drop
#[cfg(feature = "otel")]
pub struct TelemetryGuard {
    metrics: Option<prometheus::Registry>,
}

#[cfg(feature = "otel")]
impl TelemetryGuard {
    /// Registry holding recorded metrics, for an embedder to expose
    pub fn metrics_registry(&self) -> Option<&prometheus::Registry> {
        self.metrics.as_ref()
    }
}

#[cfg(feature = "otel")]
impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

#[cfg(feature = "otel")]
fn resource(config: &TelemetryConfig) -> opentelemetry_sdk::Resource {
    use opentelemetry::KeyValue;

    let mut attributes = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(instance) = &config.instance {
        attributes.push(KeyValue::new("service.instance.id", instance.clone()));
    }
    opentelemetry_sdk::Resource::new(attributes)
}

/// Install the global subscriber, OTLP exporter and metrics provider
#[cfg(feature = "otel")]
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry_otlp::WithExportConfig;
    use tracing_subscriber::prelude::*;

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::Config::default().with_resource(resource(&config)),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .map_err(|e| Error::internal(format!("OTLP pipeline: {}", e)))?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(&config)?)
        .with(config.stdout_enabled.then(tracing_subscriber::fmt::layer))
        .with(otel_layer)
        .try_init()
        .map_err(subscriber_error)?;

    let metrics = if config.metrics_enabled {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| Error::internal(format!("Prometheus exporter: {}", e)))?;
        let provider = opentelemetry_sdk::metrics::MeterProviderBuilder::default()
            .with_resource(resource(&config))
            .with_reader(exporter)
            .build();
        opentelemetry::global::set_meter_provider(provider);
        Some(registry)
    } else {
        None
    };

    tracing::info!(
        service = %config.service_name,
        instance = ?config.instance,
        otlp_endpoint = ?config.otlp_endpoint,
        metrics = config.metrics_enabled,
        "Telemetry initialized"
    );
    Ok(TelemetryGuard { metrics })
}

// =============================================================================
// Logging Only
// =============================================================================

#[cfg(not(feature = "otel"))]
#[derive(Debug)]
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global logging subscriber
///
/// OTLP export and metrics are requested but unavailable without the `otel`
/// feature; that is reported once and otherwise ignored.
#[cfg(not(feature = "otel"))]
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(env_filter(&config)?)
        .with(config.stdout_enabled.then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(subscriber_error)?;

    if config.otlp_endpoint.is_some() || config.metrics_enabled {
        tracing::warn!("OTLP export and metrics need the otel feature, ignoring");
    }
    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let config = TelemetryConfig::default().apply_env(env(&[
            ("OTEL_SERVICE_NAME", "registry-eu"),
            ("ACTUARY_INSTANCE", "registry-eu-2"),
            ("RUST_LOG", "actuary_registry=debug"),
            ("METRICS_ENABLED", "true"),
        ]));

        assert_eq!(config.service_name, "registry-eu");
        assert_eq!(config.instance.as_deref(), Some("registry-eu-2"));
        assert_eq!(config.log_filter, "actuary_registry=debug");
        assert!(config.metrics_enabled);
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_blank_and_garbage_env_ignored() {
        let config = TelemetryConfig::new("actuary")
            .with_metrics()
            .apply_env(env(&[("RUST_LOG", "  "), ("METRICS_ENABLED", "yes")]));

        assert_eq!(config.log_filter, "info");
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_bad_filter_rejected() {
        let config = TelemetryConfig::default().with_log_level("actuary=loud");
        assert!(env_filter(&config).is_err());
    }
}
