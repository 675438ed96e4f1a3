//! Configuration for Actuary
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for Actuary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActuaryConfig {
    /// Registry behaviour (deadlines, sweeps, retention)
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Lease liveness configuration
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Coordination store write retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Coordination store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Watch reconnect policy
    #[serde(default)]
    pub resync: ResyncConfig,
}

impl ActuaryConfig {
    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| Error::ConfigurationRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.lease.validate()?;
        self.retry.validate()?;
        self.store.validate()?;
        self.resync.validate()?;
        Ok(())
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Key prefix under which actuator records live in the coordination store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Default deadline for API calls (milliseconds)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Interval between liveness sweeps (milliseconds)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// How long Removed records are retained before compaction (milliseconds)
    #[serde(default = "default_removed_retention_ms")]
    pub removed_retention_ms: u64,

    /// Capacity of the membership event channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_key_prefix() -> String {
    "/actuary/actuators/".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    OPERATION_TIMEOUT_MS_DEFAULT
}

fn default_sweep_interval_ms() -> u64 {
    LIVENESS_SWEEP_INTERVAL_MS_DEFAULT
}

fn default_removed_retention_ms() -> u64 {
    REMOVED_RETENTION_MS_DEFAULT
}

fn default_event_channel_capacity() -> usize {
    EVENT_CHANNEL_CAPACITY_DEFAULT
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            removed_retention_ms: default_removed_retention_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl RegistryConfig {
    /// Default deadline as a `Duration`
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if !self.key_prefix.starts_with('/') || !self.key_prefix.ends_with('/') {
            return Err(Error::invalid_config(
                "registry.key_prefix",
                "must start and end with '/'",
            ));
        }

        // Address reservations are kept in the sibling `addresses/` prefix
        if self.key_prefix == "/" || self.key_prefix.ends_with("/addresses/") {
            return Err(Error::invalid_config(
                "registry.key_prefix",
                "must name a segment other than 'addresses'",
            ));
        }

        if self.operation_timeout_ms == 0 || self.operation_timeout_ms > OPERATION_TIMEOUT_MS_MAX {
            return Err(Error::invalid_config(
                "registry.operation_timeout_ms",
                format!("must be in 1..={}", OPERATION_TIMEOUT_MS_MAX),
            ));
        }

        if self.sweep_interval_ms == 0 {
            return Err(Error::invalid_config(
                "registry.sweep_interval_ms",
                "must be positive",
            ));
        }

        if self.event_channel_capacity == 0 {
            return Err(Error::invalid_config(
                "registry.event_channel_capacity",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Lease configuration
///
/// A record whose lease expires turns Unhealthy at once and is Removed once
/// `grace_period_ms` has passed without renewal, so a silent node leaves the
/// healthy listing within `ttl_ms` and is gone within `ttl_ms + grace_period_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease time-to-live (milliseconds)
    #[serde(default = "default_lease_ttl_ms")]
    pub ttl_ms: u64,

    /// Grace period between expiry and removal (milliseconds)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    LEASE_TTL_MS_DEFAULT
}

fn default_grace_period_ms() -> u64 {
    LEASE_GRACE_PERIOD_MS_DEFAULT
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lease_ttl_ms(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl LeaseConfig {
    /// Create a lease config with the given TTL and grace period
    pub fn new(ttl_ms: u64, grace_period_ms: u64) -> Self {
        Self {
            ttl_ms,
            grace_period_ms,
        }
    }

    /// Upper bound on how long a dead node can stay in the registry
    pub fn reconciliation_window_ms(&self) -> u64 {
        self.ttl_ms.saturating_add(self.grace_period_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.ttl_ms < LEASE_TTL_MS_MIN || self.ttl_ms > LEASE_TTL_MS_MAX {
            return Err(Error::invalid_config(
                "lease.ttl_ms",
                format!(
                    "{} outside [{}, {}]",
                    self.ttl_ms, LEASE_TTL_MS_MIN, LEASE_TTL_MS_MAX
                ),
            ));
        }

        if self.grace_period_ms >= self.ttl_ms {
            return Err(Error::invalid_config(
                "lease.grace_period_ms",
                "must be less than lease.ttl_ms",
            ));
        }
        Ok(())
    }
}

/// Retry policy for coordination store writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per store call (first try included)
    #[serde(default = "default_attempts_max")]
    pub attempts_max: u32,

    /// First backoff interval (milliseconds)
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Cap on the backoff interval (milliseconds)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Backoff growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_attempts_max() -> u32 {
    STORE_RETRY_ATTEMPTS_COUNT_DEFAULT
}

fn default_backoff_initial_ms() -> u64 {
    STORE_RETRY_BACKOFF_MS_INITIAL
}

fn default_backoff_max_ms() -> u64 {
    STORE_RETRY_BACKOFF_MS_MAX
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts_max: default_attempts_max(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            attempts_max: 1,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.attempts_max == 0 || self.attempts_max > STORE_RETRY_ATTEMPTS_COUNT_MAX {
            return Err(Error::invalid_config(
                "retry.attempts_max",
                format!("must be in 1..={}", STORE_RETRY_ATTEMPTS_COUNT_MAX),
            ));
        }

        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(Error::invalid_config(
                "retry.backoff_initial_ms",
                "must not exceed retry.backoff_max_ms",
            ));
        }

        if self.multiplier < 1.0 {
            return Err(Error::invalid_config(
                "retry.multiplier",
                "must be >= 1.0",
            ));
        }
        Ok(())
    }
}

/// Coordination store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend type
    #[serde(default)]
    pub backend: StoreBackend,

    /// Store endpoints (for the etcd backend)
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Coordination store backend type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store (single node, testing)
    #[default]
    Memory,

    /// etcd cluster
    Etcd,
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.backend == StoreBackend::Etcd && self.endpoints.is_empty() {
            return Err(Error::invalid_config(
                "store.endpoints",
                "required when backend is etcd",
            ));
        }
        Ok(())
    }
}

/// Watch reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// First delay before re-subscribing (milliseconds)
    #[serde(default = "default_resync_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Cap on the re-subscribe delay (milliseconds)
    #[serde(default = "default_resync_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_resync_backoff_initial_ms() -> u64 {
    RESYNC_BACKOFF_MS_INITIAL
}

fn default_resync_backoff_max_ms() -> u64 {
    RESYNC_BACKOFF_MS_MAX
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_resync_backoff_initial_ms(),
            backoff_max_ms: default_resync_backoff_max_ms(),
        }
    }
}

impl ResyncConfig {
    fn validate(&self) -> Result<()> {
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(Error::invalid_config(
                "resync.backoff_initial_ms",
                "must be positive and not exceed resync.backoff_max_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ActuaryConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_grace_period_must_be_below_ttl() {
        let mut config = ActuaryConfig::default();
        config.lease.ttl_ms = 2000;
        config.lease.grace_period_ms = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_etcd_requires_endpoints() {
        let mut config = ActuaryConfig::default();
        config.store.backend = StoreBackend::Etcd;
        assert!(config.validate().is_err());

        config.store.endpoints = vec!["http://127.0.0.1:2379".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_key_prefix_shape() {
        let mut config = ActuaryConfig::default();
        config.registry.key_prefix = "actuators".into();
        assert!(config.validate().is_err());

        config.registry.key_prefix = "/".into();
        assert!(config.validate().is_err());
        config.registry.key_prefix = "/actuary/addresses/".into();
        assert!(config.validate().is_err());
        config.registry.key_prefix = "/cluster-a/actuators/".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_attempts_bounded() {
        let mut config = ActuaryConfig::default();
        config.retry.attempts_max = 0;
        assert!(config.validate().is_err());

        config.retry.attempts_max = STORE_RETRY_ATTEMPTS_COUNT_MAX + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
lease:
  ttl_ms: 3000
  grace_period_ms: 1000
store:
  backend: etcd
  endpoints: ["http://10.0.0.5:2379"]
"#;
        let config = ActuaryConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.lease.ttl_ms, 3000);
        assert_eq!(config.lease.reconciliation_window_ms(), 4000);
        assert_eq!(config.store.backend, StoreBackend::Etcd);
        assert_eq!(config.registry.key_prefix, "/actuary/actuators/");
        assert_eq!(config.retry.attempts_max, 3);
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        let yaml = "lease:\n  ttl_ms: 10\n";
        let err = ActuaryConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
    }
}
