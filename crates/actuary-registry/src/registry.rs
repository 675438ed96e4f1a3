//! Actuator registry runtime
//!
//! Owns one Node Record Store and wires the Membership Manager, Liveness
//! Tracker and Query Service around it. Nothing here is process-global;
//! several registries can run side by side against different stores.

use crate::api::RegistryApi;
use crate::coordination::CoordinationStore;
use crate::error::{RegistryError, RegistryResult};
use crate::events::{EventPublisher, MembershipEvent};
use crate::liveness::{LivenessTask, LivenessTracker};
use crate::locks::KeyedLocks;
use crate::membership::MembershipManager;
use crate::query::QueryService;
use crate::record_store::NodeRecordStore;
use actuary_core::{ActuaryConfig, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// A running registry instance
pub struct ActuatorRegistry {
    membership: Arc<MembershipManager>,
    tracker: Arc<LivenessTracker>,
    query: QueryService,
    events: EventPublisher,
    task: Option<LivenessTask>,
}

impl ActuatorRegistry {
    /// Load the current membership from `store` and start tracking it
    ///
    /// Fails if the configuration is invalid or the initial listing cannot be
    /// read.
    pub async fn start(
        config: ActuaryConfig,
        store: Arc<dyn CoordinationStore>,
        time: Arc<dyn TimeProvider>,
    ) -> RegistryResult<Self> {
        config
            .validate()
            .map_err(|e| RegistryError::internal(e.to_string()))?;

        let records = Arc::new(NodeRecordStore::new());
        let locks = Arc::new(KeyedLocks::new());
        let events = EventPublisher::new(config.registry.event_channel_capacity);

        let membership = Arc::new(MembershipManager::new(
            &config,
            store.clone(),
            records.clone(),
            locks.clone(),
            time.clone(),
            events.clone(),
        ));
        let tracker = Arc::new(LivenessTracker::new(
            &config,
            store,
            records.clone(),
            locks,
            time,
            events.clone(),
        ));

        let revision = tracker.resync().await?;
        let task = LivenessTask::start(
            tracker.clone(),
            Duration::from_millis(config.registry.sweep_interval_ms),
            &config.resync,
        );
        info!(
            revision,
            actuators = records.snapshot().len(),
            key_prefix = %config.registry.key_prefix,
            "Actuator registry started"
        );

        Ok(Self {
            membership,
            tracker,
            query: QueryService::new(records),
            events,
            task: Some(task),
        })
    }

    /// Request/response surface
    pub fn api(&self) -> RegistryApi {
        RegistryApi::new(self.membership.clone(), self.query.clone())
    }

    pub fn membership(&self) -> &MembershipManager {
        &self.membership
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn tracker(&self) -> &LivenessTracker {
        &self.tracker
    }

    /// Receive membership events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Stop the liveness task and wait for it
    ///
    /// Registered actuators stay in the coordination store; their leases
    /// expire unless renewed through another registry.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.join().await;
        }
        info!("Actuator registry stopped");
    }
}

impl std::fmt::Debug for ActuatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuatorRegistry")
            .field("membership", &self.membership)
            .field("tracker", &self.tracker)
            .field("running", &self.task.is_some())
            .finish()
    }
}
