//! Node Record Store
//!
//! In-process, read-optimized projection of the actuator records held by the
//! coordination store.
//!
//! Readers load an immutable `RecordSnapshot` through `ArcSwap` and never
//! block. Writers build the next snapshot copy-on-write under a short commit
//! mutex and publish it with a single atomic swap, so a listing never sees a
//! half-applied mutation or a partially rebuilt view after resync.
//!
//! Within one process, address uniqueness among live (Registering/Healthy)
//! records is enforced with a claim table: a writer claims the address before
//! talking to the coordination store and releases the claim once its record
//! is committed or the write is abandoned. Across processes the reservation
//! keys written by the Membership Manager take over.
//!
//! TigerStyle: Explicit invariants, assertions on every commit.

use crate::actuator::{ActuatorName, ActuatorRecord, ActuatorStatus, Address};
use crate::coordination::Revision;
use crate::error::{RegistryError, RegistryResult};
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable point-in-time view of every known record
#[derive(Debug)]
pub struct RecordSnapshot {
    records: BTreeMap<ActuatorName, Arc<ActuatorRecord>>,
    by_address: HashMap<Address, ActuatorName>,
    healthy: Arc<[Address]>,
    generation: u64,
}

impl Default for RecordSnapshot {
    fn default() -> Self {
        Self::build(BTreeMap::new(), 0)
    }
}

impl RecordSnapshot {
    fn build(records: BTreeMap<ActuatorName, Arc<ActuatorRecord>>, generation: u64) -> Self {
        let mut by_address = HashMap::with_capacity(records.len());
        let mut healthy = Vec::new();
        for (name, record) in &records {
            if !record.status.is_live() {
                continue;
            }
            // Writers reserve addresses in the coordination store; a record
            // written around that keeps the first name in order and is never
            // handed to the dispatcher
            let holder = by_address
                .entry(record.address.clone())
                .or_insert_with(|| name.clone());
            if record.status.is_schedulable() && *holder == *name {
                healthy.push(record.address.clone());
            }
        }
        Self {
            records,
            by_address,
            healthy: healthy.into(),
            generation,
        }
    }

    /// Record by name, including Removed records awaiting compaction
    pub fn get(&self, name: &ActuatorName) -> Option<&Arc<ActuatorRecord>> {
        self.records.get(name)
    }

    /// Every non-Removed record, ordered by name
    pub fn visible(&self) -> impl Iterator<Item = &Arc<ActuatorRecord>> {
        self.records.values().filter(|r| r.status.is_visible())
    }

    /// Every record, ordered by name
    pub fn all(&self) -> impl Iterator<Item = &Arc<ActuatorRecord>> {
        self.records.values()
    }

    /// Addresses of Healthy records
    pub fn healthy_addresses(&self) -> Arc<[Address]> {
        self.healthy.clone()
    }

    /// Live record currently bound to `address`
    pub fn address_holder(&self, address: &Address) -> Option<&ActuatorName> {
        self.by_address.get(address)
    }

    /// Monotonic counter bumped by every committed change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// =============================================================================
// Address Claims
// =============================================================================

/// Pending claim on an address; released on drop
#[derive(Debug)]
pub struct AddressClaim<'a> {
    claims: &'a DashMap<Address, ActuatorName>,
    address: Address,
    name: ActuatorName,
}

impl AddressClaim<'_> {
    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl Drop for AddressClaim<'_> {
    fn drop(&mut self) {
        self.claims
            .remove_if(&self.address, |_, holder| *holder == self.name);
    }
}

// =============================================================================
// NodeRecordStore
// =============================================================================

/// A committed change to one record
#[derive(Debug, Clone)]
pub struct Transition {
    /// Record before the change (`None` for a first insert)
    pub previous: Option<Arc<ActuatorRecord>>,
    pub current: Arc<ActuatorRecord>,
}

/// Authoritative in-memory mapping from name to actuator record
#[derive(Debug, Default)]
pub struct NodeRecordStore {
    snapshot: ArcSwap<RecordSnapshot>,
    commit: Mutex<()>,
    claims: DashMap<Address, ActuatorName>,
    degraded: AtomicBool,
}

impl NodeRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; never blocks
    pub fn snapshot(&self) -> Arc<RecordSnapshot> {
        self.snapshot.load_full()
    }

    /// Record by name (Removed included)
    pub fn get(&self, name: &ActuatorName) -> Option<Arc<ActuatorRecord>> {
        self.snapshot.load().get(name).cloned()
    }

    /// True while the local view may lag the coordination store
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Set the degraded flag, returning the previous value
    pub fn set_degraded(&self, degraded: bool) -> bool {
        self.degraded.swap(degraded, Ordering::SeqCst)
    }

    /// Claim `address` for `name`
    ///
    /// Fails with `AddressInUse` if another live record holds it or another
    /// writer has an outstanding claim on it.
    pub fn claim_address(
        &self,
        address: &Address,
        name: &ActuatorName,
    ) -> RegistryResult<AddressClaim<'_>> {
        let in_use = |holder: &ActuatorName| RegistryError::AddressInUse {
            address: address.to_string(),
            holder: holder.to_string(),
        };

        match self.claims.entry(address.clone()) {
            Entry::Occupied(entry) => Err(in_use(entry.get())),
            Entry::Vacant(entry) => {
                if let Some(holder) = self.snapshot.load().address_holder(address) {
                    if holder != name {
                        return Err(in_use(holder));
                    }
                }
                entry.insert(name.clone());
                Ok(AddressClaim {
                    claims: &self.claims,
                    address: address.clone(),
                    name: name.clone(),
                })
            }
        }
    }

    /// Apply `record` if it is newer than the local copy
    ///
    /// Newer means a strictly greater store revision, which makes replays of
    /// the registry's own writes through the watch stream no-ops.
    pub fn apply(&self, record: ActuatorRecord) -> Option<Transition> {
        self.mutate(|records| {
            if let Some(current) = records.get(&record.name) {
                if record.revision <= current.revision {
                    return None;
                }
            }
            let current = Arc::new(record);
            let previous = records.insert(current.name.clone(), current.clone());
            Some(Transition { previous, current })
        })
    }

    /// Move `name` to `status` without a new store revision
    ///
    /// Applies only if the transition is legal. `revision`, when given, must
    /// be newer than the local copy and is stamped onto the record.
    pub fn set_status(
        &self,
        name: &ActuatorName,
        status: ActuatorStatus,
        revision: Option<Revision>,
        now_ms: u64,
    ) -> Option<Transition> {
        self.mutate(|records| {
            let current = records.get(name)?.clone();
            if !current.status.can_transition_to(status) {
                return None;
            }
            let mut next = current.with_status(status, now_ms);
            if let Some(revision) = revision {
                if revision <= current.revision {
                    return None;
                }
                next.revision = revision;
            }
            let next = Arc::new(next);
            records.insert(name.clone(), next.clone());
            Some(Transition {
                previous: Some(current),
                current: next,
            })
        })
    }

    /// Drop a Removed record, provided it has not been rewritten since
    pub fn evict(&self, name: &ActuatorName, revision: Revision) -> bool {
        self.mutate(|records| {
            let current = records.get(name)?;
            if current.status != ActuatorStatus::Removed || current.revision != revision {
                return None;
            }
            records.remove(name);
            Some(())
        })
        .is_some()
    }

    /// Replace the whole record set atomically
    ///
    /// `rebuild` runs under the commit lock against the current snapshot so
    /// no concurrent commit can be lost between read and swap.
    pub fn replace_with<F>(&self, rebuild: F) -> Arc<RecordSnapshot>
    where
        F: FnOnce(&RecordSnapshot) -> Vec<ActuatorRecord>,
    {
        let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();
        let records = rebuild(&current)
            .into_iter()
            .map(|r| (r.name.clone(), Arc::new(r)))
            .collect();
        let next = Arc::new(RecordSnapshot::build(records, current.generation + 1));
        self.snapshot.store(next.clone());
        next
    }

    fn mutate<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut BTreeMap<ActuatorName, Arc<ActuatorRecord>>) -> Option<T>,
    {
        let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();
        let mut records = current.records.clone();
        let out = f(&mut records)?;
        let next = RecordSnapshot::build(records, current.generation + 1);
        debug_assert!(next.generation > current.generation);
        self.snapshot.store(Arc::new(next));
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorMetadata;

    fn test_name(n: u32) -> ActuatorName {
        ActuatorName::new(format!("node-{}", n)).unwrap()
    }

    fn test_addr(n: u32) -> Address {
        Address::new(format!("10.0.0.{}", n), 9000).unwrap()
    }

    fn test_record(n: u32, status: ActuatorStatus, revision: Revision) -> ActuatorRecord {
        let mut record = ActuatorRecord::new(
            test_name(n),
            test_addr(n),
            ActuatorMetadata::default(),
            n as i64,
            1_000,
        );
        record.status = status;
        record.revision = revision;
        record
    }

    #[test]
    fn test_apply_requires_newer_revision() {
        let store = NodeRecordStore::new();

        assert!(store.apply(test_record(1, ActuatorStatus::Registering, 5)).is_some());
        assert!(store.apply(test_record(1, ActuatorStatus::Healthy, 5)).is_none());
        assert!(store.apply(test_record(1, ActuatorStatus::Healthy, 4)).is_none());
        assert_eq!(store.get(&test_name(1)).unwrap().status, ActuatorStatus::Registering);

        assert!(store.apply(test_record(1, ActuatorStatus::Healthy, 6)).is_some());
        assert_eq!(store.get(&test_name(1)).unwrap().status, ActuatorStatus::Healthy);
    }

    #[test]
    fn test_healthy_index_tracks_status() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 1));
        store.apply(test_record(2, ActuatorStatus::Registering, 2));
        store.apply(test_record(3, ActuatorStatus::Unhealthy, 3));

        let snapshot = store.snapshot();
        assert_eq!(&*snapshot.healthy_addresses(), &[test_addr(1)]);
        assert_eq!(snapshot.visible().count(), 3);
        assert!(snapshot.address_holder(&test_addr(2)).is_some());
        assert!(snapshot.address_holder(&test_addr(3)).is_none());
    }

    #[test]
    fn test_healthy_index_never_lists_an_address_twice() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 1));
        let mut twin = test_record(2, ActuatorStatus::Healthy, 2);
        twin.address = test_addr(1);
        store.apply(twin);

        let snapshot = store.snapshot();
        assert_eq!(&*snapshot.healthy_addresses(), &[test_addr(1)]);
        assert_eq!(snapshot.address_holder(&test_addr(1)), Some(&test_name(1)));
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 1));

        let before = store.snapshot();
        store.set_status(&test_name(1), ActuatorStatus::Unhealthy, None, 2_000);

        assert_eq!(before.healthy_addresses().len(), 1);
        assert_eq!(store.snapshot().healthy_addresses().len(), 0);
        assert!(store.snapshot().generation() > before.generation());
    }

    #[test]
    fn test_set_status_respects_transitions() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 1));

        let change = store
            .set_status(&test_name(1), ActuatorStatus::Removed, None, 2_000)
            .unwrap();
        assert_eq!(change.previous.unwrap().status, ActuatorStatus::Healthy);
        assert_eq!(change.current.removed_at_ms, Some(2_000));

        // Removed is terminal
        assert!(store
            .set_status(&test_name(1), ActuatorStatus::Healthy, None, 3_000)
            .is_none());
    }

    #[test]
    fn test_set_status_with_stale_revision_ignored() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 10));

        assert!(store
            .set_status(&test_name(1), ActuatorStatus::Unhealthy, Some(9), 2_000)
            .is_none());
        let change = store
            .set_status(&test_name(1), ActuatorStatus::Unhealthy, Some(11), 2_000)
            .unwrap();
        assert_eq!(change.current.revision, 11);
    }

    #[test]
    fn test_claim_address_conflicts() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 1));

        // Held by a live record
        let err = store.claim_address(&test_addr(1), &test_name(2)).unwrap_err();
        assert!(matches!(err, RegistryError::AddressInUse { .. }));

        // Outstanding claim blocks a second claimer
        let claim = store.claim_address(&test_addr(5), &test_name(5)).unwrap();
        assert!(store.claim_address(&test_addr(5), &test_name(6)).is_err());
        drop(claim);
        assert!(store.claim_address(&test_addr(5), &test_name(6)).is_ok());
    }

    #[test]
    fn test_claim_released_after_unhealthy() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 1));
        store.set_status(&test_name(1), ActuatorStatus::Unhealthy, None, 2_000);

        assert!(store.claim_address(&test_addr(1), &test_name(2)).is_ok());
    }

    #[test]
    fn test_evict_only_removed_at_revision() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 1));
        assert!(!store.evict(&test_name(1), 1));

        store.set_status(&test_name(1), ActuatorStatus::Removed, None, 2_000);
        assert!(!store.evict(&test_name(1), 7));
        assert!(store.evict(&test_name(1), 1));
        assert!(store.get(&test_name(1)).is_none());
    }

    #[test]
    fn test_replace_with_is_atomic() {
        let store = NodeRecordStore::new();
        store.apply(test_record(1, ActuatorStatus::Healthy, 1));
        store.apply(test_record(2, ActuatorStatus::Healthy, 2));

        let snapshot = store.replace_with(|current| {
            assert_eq!(current.len(), 2);
            vec![test_record(3, ActuatorStatus::Healthy, 9)]
        });
        assert_eq!(snapshot.len(), 1);
        assert!(store.get(&test_name(1)).is_none());
        assert_eq!(&*store.snapshot().healthy_addresses(), &[test_addr(3)]);
    }

    #[test]
    fn test_degraded_flag() {
        let store = NodeRecordStore::new();
        assert!(!store.is_degraded());
        assert!(!store.set_degraded(true));
        assert!(store.is_degraded());
        assert!(store.set_degraded(false));
    }
}
