//! Membership change notifications
//!
//! Every committed change to the Node Record Store, whether it came from an
//! API call or from the watch stream, is published exactly once on a bounded
//! broadcast channel. Lagging subscribers lose the oldest events.

use crate::actuator::{ActuatorRecord, ActuatorStatus};
use crate::record_store::Transition;
use actuary_core::metrics::record_liveness_transition;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A change in registry membership
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// Record appeared (first insert or name reuse after removal)
    Created(Arc<ActuatorRecord>),
    /// Address or metadata changed
    Changed {
        previous: Arc<ActuatorRecord>,
        current: Arc<ActuatorRecord>,
    },
    /// Record moved to Removed
    Deleted(Arc<ActuatorRecord>),
    /// Liveness flip (Registering/Healthy/Unhealthy)
    StatusChanged {
        record: Arc<ActuatorRecord>,
        from: ActuatorStatus,
        to: ActuatorStatus,
    },
    /// Whole record set replaced after a watch reconnect
    Resynced { records: usize },
}

impl MembershipEvent {
    /// Classify a committed transition
    pub fn from_transition(transition: &Transition) -> Option<Self> {
        let current = transition.current.clone();
        let previous = match &transition.previous {
            Some(p) if p.status.is_visible() => p.clone(),
            _ => {
                return current
                    .status
                    .is_visible()
                    .then_some(MembershipEvent::Created(current));
            }
        };

        if current.status == ActuatorStatus::Removed {
            return Some(MembershipEvent::Deleted(current));
        }
        if previous.status != current.status {
            return Some(MembershipEvent::StatusChanged {
                from: previous.status,
                to: current.status,
                record: current,
            });
        }
        if previous.address != current.address || previous.metadata != current.metadata {
            return Some(MembershipEvent::Changed { previous, current });
        }
        None
    }
}

/// Sender side of the membership event channel
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<MembershipEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: MembershipEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Publish whatever `transition` amounts to, counting status changes
    pub fn publish_transition(&self, transition: &Transition) {
        let previous_status = transition.previous.as_ref().map(|p| p.status);
        if previous_status != Some(transition.current.status) {
            record_liveness_transition(
                previous_status.map(|s| s.as_str()),
                transition.current.status.as_str(),
            );
        }
        if let Some(event) = MembershipEvent::from_transition(transition) {
            self.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorMetadata, ActuatorName, Address};

    fn test_record(status: ActuatorStatus) -> Arc<ActuatorRecord> {
        let mut record = ActuatorRecord::new(
            ActuatorName::new("node-1").unwrap(),
            Address::new("10.0.0.1", 9000).unwrap(),
            ActuatorMetadata::default(),
            1,
            1_000,
        );
        record.status = status;
        Arc::new(record)
    }

    fn transition(
        previous: Option<Arc<ActuatorRecord>>,
        current: Arc<ActuatorRecord>,
    ) -> Transition {
        Transition { previous, current }
    }

    #[test]
    fn test_classify_created() {
        let t = transition(None, test_record(ActuatorStatus::Registering));
        assert!(matches!(
            MembershipEvent::from_transition(&t),
            Some(MembershipEvent::Created(_))
        ));

        // Name reuse after removal
        let t = transition(
            Some(test_record(ActuatorStatus::Removed)),
            test_record(ActuatorStatus::Healthy),
        );
        assert!(matches!(
            MembershipEvent::from_transition(&t),
            Some(MembershipEvent::Created(_))
        ));

        // Tombstone seen for an unknown name
        let t = transition(None, test_record(ActuatorStatus::Removed));
        assert!(MembershipEvent::from_transition(&t).is_none());
    }

    #[test]
    fn test_classify_status_and_delete() {
        let t = transition(
            Some(test_record(ActuatorStatus::Healthy)),
            test_record(ActuatorStatus::Unhealthy),
        );
        assert!(matches!(
            MembershipEvent::from_transition(&t),
            Some(MembershipEvent::StatusChanged {
                from: ActuatorStatus::Healthy,
                to: ActuatorStatus::Unhealthy,
                ..
            })
        ));

        let t = transition(
            Some(test_record(ActuatorStatus::Unhealthy)),
            test_record(ActuatorStatus::Removed),
        );
        assert!(matches!(
            MembershipEvent::from_transition(&t),
            Some(MembershipEvent::Deleted(_))
        ));
    }

    #[test]
    fn test_classify_changed() {
        let previous = test_record(ActuatorStatus::Healthy);
        let mut current = (*previous).clone();
        current.address = Address::new("10.0.0.2", 9000).unwrap();

        let t = transition(Some(previous), Arc::new(current));
        assert!(matches!(
            MembershipEvent::from_transition(&t),
            Some(MembershipEvent::Changed { .. })
        ));
    }

    #[tokio::test]
    async fn test_publisher_delivers() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish_transition(&transition(None, test_record(ActuatorStatus::Healthy)));
        assert!(matches!(rx.recv().await, Ok(MembershipEvent::Created(_))));
    }
}
