//! Registry metrics
//!
//! Three families: API calls by result code, coordination store calls by
//! outcome, and actuator status transitions. Instruments are created on
//! first use from the global meter provider installed by `init_telemetry`.
//! Without the `otel` feature every recorder compiles to nothing.

#[cfg(feature = "otel")]
mod instruments {
    use crate::constants::*;
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram};
    use opentelemetry::global;

    pub(super) struct Instruments {
        pub registry_calls: Counter<u64>,
        pub registry_seconds: Histogram<f64>,
        pub store_calls: Counter<u64>,
        pub store_seconds: Histogram<f64>,
        pub transitions: Counter<u64>,
    }

    pub(super) static INSTRUMENTS: Lazy<Instruments> = Lazy::new(|| {
        let meter = global::meter(METRICS_METER_NAME);
        Instruments {
            registry_calls: meter
                .u64_counter(METRIC_NAME_REGISTRY_OPERATIONS_TOTAL)
                .with_description("Registry API calls by result code")
                .init(),
            registry_seconds: meter
                .f64_histogram(METRIC_NAME_REGISTRY_OPERATION_DURATION_SECONDS)
                .with_description("Registry API call latency")
                .init(),
            store_calls: meter
                .u64_counter(METRIC_NAME_STORE_OPERATIONS_TOTAL)
                .with_description("Coordination store attempts by outcome")
                .init(),
            store_seconds: meter
                .f64_histogram(METRIC_NAME_STORE_DURATION_SECONDS)
                .with_description("Coordination store attempt latency")
                .init(),
            transitions: meter
                .u64_counter(METRIC_NAME_LIVENESS_TRANSITIONS_TOTAL)
                .with_description("Actuator status transitions")
                .init(),
        }
    });
}

/// One registry API call, labelled with the result code it returned
#[cfg(feature = "otel")]
pub fn record_registry_operation(operation: &'static str, code: &str, seconds: f64) {
    use opentelemetry::KeyValue;

    let m = &instruments::INSTRUMENTS;
    let op = KeyValue::new("operation", operation);
    m.registry_calls
        .add(1, &[op.clone(), KeyValue::new("code", code.to_string())]);
    m.registry_seconds.record(seconds, &[op]);
}

/// One coordination store attempt (retries count separately)
#[cfg(feature = "otel")]
pub fn record_store_operation(operation: &'static str, outcome: &'static str, seconds: f64) {
    use opentelemetry::KeyValue;

    let m = &instruments::INSTRUMENTS;
    let op = KeyValue::new("operation", operation);
    m.store_calls
        .add(1, &[op.clone(), KeyValue::new("outcome", outcome)]);
    m.store_seconds.record(seconds, &[op]);
}

/// Actuator moved from `from` (absent for a first sighting) to `to`
#[cfg(feature = "otel")]
pub fn record_liveness_transition(from: Option<&str>, to: &str) {
    use opentelemetry::KeyValue;

    instruments::INSTRUMENTS.transitions.add(
        1,
        &[
            KeyValue::new("from", from.unwrap_or("none").to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}

#[cfg(not(feature = "otel"))]
pub fn record_registry_operation(_operation: &'static str, _code: &str, _seconds: f64) {}

#[cfg(not(feature = "otel"))]
pub fn record_store_operation(_operation: &'static str, _outcome: &'static str, _seconds: f64) {}

#[cfg(not(feature = "otel"))]
pub fn record_liveness_transition(_from: Option<&str>, _to: &str) {}
