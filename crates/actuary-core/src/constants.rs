//! TigerStyle constants for Actuary
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Actuator Limits
// =============================================================================

/// Maximum length of an actuator name in bytes
pub const ACTUATOR_NAME_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of an actuator host in bytes (DNS name limit)
pub const ACTUATOR_HOST_LENGTH_BYTES_MAX: usize = 253;

/// Maximum number of tags attached to one actuator
pub const ACTUATOR_TAGS_COUNT_MAX: usize = 64;

/// Maximum length of a tag key or value in bytes
pub const ACTUATOR_TAG_LENGTH_BYTES_MAX: usize = 256;

/// Maximum number of actuators tracked by one registry
pub const REGISTRY_ACTUATORS_COUNT_MAX: usize = 100_000;

// =============================================================================
// Lease Limits
// =============================================================================

/// Default lease TTL in milliseconds (10 sec)
pub const LEASE_TTL_MS_DEFAULT: u64 = 10 * 1000;

/// Minimum lease TTL in milliseconds (1 sec, etcd granularity)
pub const LEASE_TTL_MS_MIN: u64 = 1000;

/// Maximum lease TTL in milliseconds (5 min)
pub const LEASE_TTL_MS_MAX: u64 = 5 * 60 * 1000;

/// Default grace period after lease expiry before removal (5 sec)
pub const LEASE_GRACE_PERIOD_MS_DEFAULT: u64 = 5 * 1000;

// =============================================================================
// Operation Limits
// =============================================================================

/// Default deadline for a registry API call in milliseconds (5 sec)
pub const OPERATION_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

/// Maximum deadline for a registry API call in milliseconds (2 min)
pub const OPERATION_TIMEOUT_MS_MAX: u64 = 2 * 60 * 1000;

/// Budget for rolling back a lease after a failed create (1 sec)
pub const LEASE_ROLLBACK_TIMEOUT_MS: u64 = 1000;

/// Default number of attempts for a coordination store write
pub const STORE_RETRY_ATTEMPTS_COUNT_DEFAULT: u32 = 3;

/// Maximum number of attempts for a coordination store write
pub const STORE_RETRY_ATTEMPTS_COUNT_MAX: u32 = 10;

/// Default initial retry backoff in milliseconds
pub const STORE_RETRY_BACKOFF_MS_INITIAL: u64 = 50;

/// Default maximum retry backoff in milliseconds
pub const STORE_RETRY_BACKOFF_MS_MAX: u64 = 1000;

// =============================================================================
// Liveness Limits
// =============================================================================

/// Default interval between liveness sweeps in milliseconds
pub const LIVENESS_SWEEP_INTERVAL_MS_DEFAULT: u64 = 500;

/// Default retention of Removed records before compaction (1 min)
pub const REMOVED_RETENTION_MS_DEFAULT: u64 = 60 * 1000;

/// Default initial backoff before re-subscribing a lost watch
pub const RESYNC_BACKOFF_MS_INITIAL: u64 = 100;

/// Default maximum backoff before re-subscribing a lost watch
pub const RESYNC_BACKOFF_MS_MAX: u64 = 5 * 1000;

/// Capacity of the membership event broadcast channel
pub const EVENT_CHANNEL_CAPACITY_DEFAULT: usize = 256;

/// Capacity of a single watch stream buffer
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Observability - Metric Names (TigerStyle: explicit, with units)
// =============================================================================

/// Metric: Total number of registry API operations (counter, labels: operation, status)
/// Meter under which all registry instruments are created
pub const METRICS_METER_NAME: &str = "actuary";

pub const METRIC_NAME_REGISTRY_OPERATIONS_TOTAL: &str = "actuary_registry_operations_total";

/// Metric: Registry API operation duration in seconds (histogram, labels: operation)
pub const METRIC_NAME_REGISTRY_OPERATION_DURATION_SECONDS: &str =
    "actuary_registry_operation_duration_seconds";

/// Metric: Total coordination store operations (counter, labels: operation, status)
pub const METRIC_NAME_STORE_OPERATIONS_TOTAL: &str = "actuary_store_operations_total";

/// Metric: Coordination store operation duration in seconds (histogram, labels: operation)
pub const METRIC_NAME_STORE_DURATION_SECONDS: &str = "actuary_store_duration_seconds";

/// Metric: Total liveness status transitions (counter, labels: status)
pub const METRIC_NAME_LIVENESS_TRANSITIONS_TOTAL: &str = "actuary_liveness_transitions_total";

// Compile-time assertions for constant validity
const _: () = {
    assert!(ACTUATOR_NAME_LENGTH_BYTES_MAX >= 64);
    assert!(LEASE_TTL_MS_MIN <= LEASE_TTL_MS_DEFAULT);
    assert!(LEASE_TTL_MS_DEFAULT <= LEASE_TTL_MS_MAX);
    assert!(LEASE_GRACE_PERIOD_MS_DEFAULT < LEASE_TTL_MS_DEFAULT);
    assert!(STORE_RETRY_ATTEMPTS_COUNT_DEFAULT <= STORE_RETRY_ATTEMPTS_COUNT_MAX);
    assert!(OPERATION_TIMEOUT_MS_DEFAULT <= OPERATION_TIMEOUT_MS_MAX);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_have_units_in_names() {
        // All byte limits end in _BYTES_, time limits in _MS_, counts in _COUNT_
        let _: usize = ACTUATOR_NAME_LENGTH_BYTES_MAX;
        let _: u64 = LEASE_TTL_MS_DEFAULT;
        let _: usize = REGISTRY_ACTUATORS_COUNT_MAX;
    }

    #[test]
    fn test_retry_defaults_match_transport() {
        assert_eq!(STORE_RETRY_ATTEMPTS_COUNT_DEFAULT, 3);
    }
}
