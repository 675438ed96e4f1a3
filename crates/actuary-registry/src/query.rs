//! Query Service
//!
//! Cache-only reads. Every call reads one immutable snapshot of the Node
//! Record Store and never contacts the coordination store, so reads never
//! wait on writers and never observe a half-applied resync.

use crate::actuator::{ActuatorName, ActuatorRecord, Address};
use crate::error::{RegistryError, RegistryResult};
use crate::record_store::{NodeRecordStore, RecordSnapshot};
use std::sync::Arc;

/// A read result tagged with the freshness of the snapshot it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed<T> {
    pub value: T,
    /// True while the watch is down and the view may lag the store
    pub stale: bool,
    /// Snapshot generation the value was read from
    pub generation: u64,
}

impl<T> Observed<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Observed<U> {
        Observed {
            value: f(self.value),
            stale: self.stale,
            generation: self.generation,
        }
    }
}

/// Read path over the Node Record Store
#[derive(Debug, Clone)]
pub struct QueryService {
    records: Arc<NodeRecordStore>,
}

impl QueryService {
    pub fn new(records: Arc<NodeRecordStore>) -> Self {
        Self { records }
    }

    fn observe<T>(&self, read: impl FnOnce(&RecordSnapshot) -> T) -> Observed<T> {
        // Degraded is read first so a concurrent recovery can only make the
        // tag conservative
        let stale = self.records.is_degraded();
        let snapshot = self.records.snapshot();
        Observed {
            value: read(&snapshot),
            stale,
            generation: snapshot.generation(),
        }
    }

    /// Record by name; `NotFound` if absent or Removed
    pub fn get(&self, name: &ActuatorName) -> RegistryResult<Observed<ActuatorRecord>> {
        let observed = self.observe(|s| {
            s.get(name)
                .filter(|r| r.status.is_visible())
                .map(|r| (**r).clone())
        });
        match observed.value {
            Some(record) => Ok(Observed {
                value: record,
                stale: observed.stale,
                generation: observed.generation,
            }),
            None => Err(RegistryError::not_found(name.as_str())),
        }
    }

    /// Every non-Removed record, ordered by name
    pub fn list(&self) -> Observed<Vec<ActuatorRecord>> {
        self.observe(|s| s.visible().map(|r| (**r).clone()).collect())
    }

    /// Addresses of Healthy records only
    pub fn list_healthy_addresses(&self) -> Observed<Arc<[Address]>> {
        self.observe(|s| s.healthy_addresses())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorMetadata, ActuatorStatus};
    use crate::error::ErrorKind;

    fn test_record(n: u32, status: ActuatorStatus, revision: u64) -> ActuatorRecord {
        let mut record = ActuatorRecord::new(
            ActuatorName::new(format!("node-{}", n)).unwrap(),
            Address::new(format!("10.0.0.{}", n), 9000).unwrap(),
            ActuatorMetadata::default(),
            n as i64,
            1_000,
        )
        .with_status(status, 1_000);
        record.revision = revision;
        record
    }

    fn test_query() -> (Arc<NodeRecordStore>, QueryService) {
        let records = Arc::new(NodeRecordStore::new());
        records.apply(test_record(1, ActuatorStatus::Healthy, 1));
        records.apply(test_record(2, ActuatorStatus::Registering, 2));
        records.apply(test_record(3, ActuatorStatus::Unhealthy, 3));
        records.apply(test_record(4, ActuatorStatus::Removed, 4));
        (records.clone(), QueryService::new(records))
    }

    #[test]
    fn test_get_hides_removed() {
        let (_, query) = test_query();

        let name = ActuatorName::new("node-3").unwrap();
        assert_eq!(query.get(&name).unwrap().value.status, ActuatorStatus::Unhealthy);

        let name = ActuatorName::new("node-4").unwrap();
        assert_eq!(query.get(&name).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_list_excludes_removed() {
        let (_, query) = test_query();
        let names: Vec<_> = query
            .list()
            .value
            .into_iter()
            .map(|r| r.name.to_string())
            .collect();
        assert_eq!(names, vec!["node-1", "node-2", "node-3"]);
    }

    #[test]
    fn test_healthy_addresses_only_healthy() {
        let (_, query) = test_query();
        let observed = query.list_healthy_addresses();
        assert_eq!(
            observed.value.as_ref(),
            &[Address::new("10.0.0.1", 9000).unwrap()]
        );
        assert!(!observed.stale);
    }

    #[test]
    fn test_reads_tagged_stale_when_degraded() {
        let (records, query) = test_query();
        let before = query.list().generation;

        records.set_degraded(true);
        let observed = query.list_healthy_addresses();
        assert!(observed.stale);
        assert_eq!(observed.generation, before);
        assert_eq!(observed.value.len(), 1);

        records.set_degraded(false);
        assert!(!query.list().stale);
    }
}
