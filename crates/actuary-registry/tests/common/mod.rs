//! Common test utilities for actuary-registry integration tests
//!
//! A registry running against `MemoryCoordinationStore` with a `ManualClock`,
//! so lease expiry and grace periods are driven explicitly by the test while
//! the background liveness task runs on real (short) intervals.

#![allow(dead_code)]

use actuary_core::{ActuaryConfig, ManualClock};
use actuary_registry::{
    ActuatorMetadata, ActuatorRegistry, ActuatorResponse, ActuatorService, CreateActuatorRequest,
    GetActuatorRequest, MemoryCoordinationStore, RegistryApi,
};
use std::sync::Arc;
use std::time::Duration;

/// Everything a scenario needs
pub struct TestCluster {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryCoordinationStore>,
    pub registry: ActuatorRegistry,
    pub api: RegistryApi,
}

pub fn test_config() -> ActuaryConfig {
    let mut config = ActuaryConfig::default();
    config.registry.sweep_interval_ms = 10;
    config.registry.operation_timeout_ms = 2_000;
    config.retry.backoff_initial_ms = 1;
    config.retry.backoff_max_ms = 10;
    config.resync.backoff_initial_ms = 5;
    config.resync.backoff_max_ms = 20;
    config
}

impl TestCluster {
    pub async fn start() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ActuaryConfig) -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryCoordinationStore::new(clock.clone()));
        Self::on_store(config, clock, store).await
    }

    /// A second registry instance sharing this cluster's store and clock
    pub async fn peer(&self) -> Self {
        Self::on_store(test_config(), self.clock.clone(), self.store.clone()).await
    }

    async fn on_store(
        config: ActuaryConfig,
        clock: Arc<ManualClock>,
        store: Arc<MemoryCoordinationStore>,
    ) -> Self {
        let registry = ActuatorRegistry::start(config, store.clone(), clock.clone())
            .await
            .expect("registry should start");
        let api = registry.api();
        // Let the liveness task open its watch
        tokio::time::sleep(Duration::from_millis(20)).await;
        Self {
            clock,
            store,
            registry,
            api,
        }
    }

    pub async fn create(&self, name: &str, host: &str, port: u16) -> ActuatorResponse {
        self.api
            .create_actuator(CreateActuatorRequest {
                name: name.into(),
                host: host.into(),
                port,
                metadata: ActuatorMetadata::default(),
                timeout_ms: None,
            })
            .await
    }

    pub async fn get(&self, name: &str) -> ActuatorResponse {
        self.api
            .get_actuator(GetActuatorRequest { name: name.into() })
            .await
    }

    pub async fn executor_ips(&self) -> Vec<String> {
        self.api.get_all_executor_ip().await.executor_ips
    }

    /// Expire every lease older than the TTL, as if no heartbeat arrived
    pub async fn let_leases_lapse(&self, ttl_ms: u64) -> usize {
        self.clock.advance(ttl_ms);
        self.store.expire_leases().await
    }

    pub async fn shutdown(self) {
        self.registry.shutdown().await;
    }
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
