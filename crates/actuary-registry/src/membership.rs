//! Membership Manager
//!
//! Write path of the registry. Enforces name and address uniqueness,
//! serializes mutations per actuator name, and writes every accepted
//! mutation through to the coordination store before committing it to the
//! Node Record Store.
//!
//! Address uniqueness holds across every registry sharing the store: each
//! live record owns a reservation key for its address, written under the
//! record's lease in the same transaction as the record. A lapsed lease
//! frees the address along with the record.
//!
//! # Create
//!
//! ```text
//! lock(name) ─> claim(address) ─> grant lease
//!     ─> txn { put Registering (absent), reserve address (absent) }
//!     ─> commit Registering ─> put Healthy (same revision) ─> commit Healthy
//!
//! any failure after the grant: revoke lease, mark local record Removed
//! ```
//!
//! # Delete
//!
//! Durable store first, cache second: the tombstone is written and the
//! reservation released in one transaction, and the lease revoked, before
//! the local record is marked Removed.
//!
//! TigerStyle: Explicit preconditions, bounded retries, explicit rollback.

use crate::actuator::{
    ActuatorMetadata, ActuatorName, ActuatorPatch, ActuatorRecord, ActuatorStatus, Address,
};
use crate::coordination::{CoordinationStore, Expect, KeySpace, LeaseId, WriteOp};
use crate::error::{RegistryError, RegistryResult};
use crate::events::EventPublisher;
use crate::locks::{KeyGuard, KeyedLocks};
use crate::record_store::NodeRecordStore;
use crate::retry::{Deadline, RetryPolicy};
use actuary_core::constants::{LEASE_ROLLBACK_TIMEOUT_MS, REGISTRY_ACTUATORS_COUNT_MAX};
use actuary_core::{ActuaryConfig, TimeProvider, VersionMismatch};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Write path over the coordination store and the local record store
pub struct MembershipManager {
    store: Arc<dyn CoordinationStore>,
    records: Arc<NodeRecordStore>,
    locks: Arc<KeyedLocks>,
    keys: KeySpace,
    retry: RetryPolicy,
    lease_ttl_ms: u64,
    operation_timeout: Duration,
    time: Arc<dyn TimeProvider>,
    events: EventPublisher,
}

impl MembershipManager {
    pub fn new(
        config: &ActuaryConfig,
        store: Arc<dyn CoordinationStore>,
        records: Arc<NodeRecordStore>,
        locks: Arc<KeyedLocks>,
        time: Arc<dyn TimeProvider>,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            records,
            locks,
            keys: KeySpace::new(config.registry.key_prefix.clone()),
            retry: RetryPolicy::from_config(&config.retry),
            lease_ttl_ms: config.lease.ttl_ms,
            operation_timeout: config.registry.operation_timeout(),
            time,
            events,
        }
    }

    fn deadline(&self, timeout: Option<Duration>) -> Deadline {
        Deadline::after(timeout.unwrap_or(self.operation_timeout))
    }

    async fn lock<'a>(
        &'a self,
        name: &ActuatorName,
        deadline: &Deadline,
    ) -> RegistryResult<KeyGuard<'a>> {
        deadline
            .run("lock", async { Ok(self.locks.lock(name).await) })
            .await
    }

    /// Live-or-unhealthy record, or `NotFound`
    fn visible(&self, name: &ActuatorName) -> RegistryResult<Arc<ActuatorRecord>> {
        self.records
            .get(name)
            .filter(|r| r.status.is_visible())
            .ok_or_else(|| RegistryError::not_found(name.as_str()))
    }

    fn commit(&self, record: ActuatorRecord) {
        if let Some(transition) = self.records.apply(record) {
            self.events.publish_transition(&transition);
        }
    }

    /// Reserve `address` for the holder of `lease`
    fn reserve(&self, address: &Address, name: &ActuatorName, lease: LeaseId) -> WriteOp {
        WriteOp::put(
            self.keys.address_key(address),
            name.as_str().as_bytes().to_vec(),
            Some(lease),
            Expect::Absent,
        )
    }

    /// Delete of `address`'s reservation, if `name` still holds it
    async fn release(
        &self,
        address: &Address,
        name: &ActuatorName,
        deadline: &Deadline,
    ) -> RegistryResult<Option<WriteOp>> {
        let key = self.keys.address_key(address);
        let held = self
            .retry
            .run("get", deadline, || self.store.get(&key))
            .await?;
        Ok(held
            .filter(|kv| kv.value == name.as_str().as_bytes())
            .map(|kv| WriteOp::delete(key, Expect::Revision(kv.mod_revision))))
    }

    /// Report a lost reservation race as `AddressInUse`
    async fn reservation_failed(&self, err: RegistryError, address: &Address) -> RegistryError {
        let key = self.keys.address_key(address);
        match err {
            RegistryError::PreconditionFailed { key: failed, .. } if failed == key => {
                let holder = match self.store.get(&key).await {
                    Ok(Some(kv)) => String::from_utf8_lossy(&kv.value).into_owned(),
                    _ => "unknown".to_string(),
                };
                debug!(address = %address, holder, "Address reserved in the store");
                RegistryError::AddressInUse {
                    address: address.to_string(),
                    holder,
                }
            }
            other => other,
        }
    }

    /// Revoke a lease that never backed a committed record
    async fn revoke_quietly(&self, lease: LeaseId) {
        let budget = Duration::from_millis(LEASE_ROLLBACK_TIMEOUT_MS);
        match tokio::time::timeout(budget, self.store.revoke_lease(lease)).await {
            Ok(Ok(())) | Ok(Err(RegistryError::LeaseNotFound { .. })) => {
                debug!(lease_id = lease, "Lease rolled back");
            }
            Ok(Err(e)) => {
                warn!(lease_id = lease, error = %e, "Lease rollback failed, lease will expire");
            }
            Err(_) => {
                warn!(
                    lease_id = lease,
                    timeout_ms = LEASE_ROLLBACK_TIMEOUT_MS,
                    "Lease rollback timed out, lease will expire"
                );
            }
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Register a new actuator
    ///
    /// Fails with `ActuatorAlreadyExists` if the name is held by a non-Removed
    /// record and `AddressInUse` if a live record is bound to the address.
    #[instrument(skip_all, fields(name = %name, address = %address))]
    pub async fn create(
        &self,
        name: ActuatorName,
        address: Address,
        metadata: ActuatorMetadata,
        timeout: Option<Duration>,
    ) -> RegistryResult<ActuatorRecord> {
        metadata.validate()?;
        let deadline = self.deadline(timeout);
        let _guard = self.lock(&name, &deadline).await?;

        let previous = self.records.get(&name);
        if previous.as_ref().is_some_and(|p| p.status.is_visible()) {
            return Err(RegistryError::already_exists(name.as_str()));
        }
        if self.records.snapshot().len() >= REGISTRY_ACTUATORS_COUNT_MAX {
            return Err(RegistryError::internal(format!(
                "registry holds {} actuators",
                REGISTRY_ACTUATORS_COUNT_MAX
            )));
        }
        let _claim = self.records.claim_address(&address, &name)?;

        let key = self.keys.key(&name);
        let expect = if previous.is_some() {
            self.reuse_precondition(&name, &key, &deadline).await?
        } else {
            Expect::Absent
        };

        let ttl_ms = self.lease_ttl_ms;
        let lease = self
            .retry
            .run("grant_lease", &deadline, || self.store.grant_lease(ttl_ms))
            .await?;
        debug!(lease_id = lease, "Lease granted");

        match self
            .register(&name, &key, address, metadata, lease, expect, &deadline)
            .await
        {
            Ok(record) => {
                info!(version = %record.version, lease_id = lease, "Actuator created");
                Ok(record)
            }
            Err(e) => {
                warn!(lease_id = lease, error = %e, "Create failed, rolling back lease");
                self.rollback_create(&name, lease).await;
                Err(e)
            }
        }
    }

    /// Precondition for re-creating a name whose last record was Removed
    async fn reuse_precondition(
        &self,
        name: &ActuatorName,
        key: &str,
        deadline: &Deadline,
    ) -> RegistryResult<Expect> {
        let stored = self
            .retry
            .run("get", deadline, || self.store.get(key))
            .await?;
        let Some(kv) = stored else {
            return Ok(Expect::Absent);
        };

        match ActuatorRecord::decode(&kv.value, kv.mod_revision) {
            Ok(record) if record.status == ActuatorStatus::Removed => {
                Ok(Expect::Revision(kv.mod_revision))
            }
            Ok(_) => Err(RegistryError::already_exists(name.as_str())),
            Err(e) => {
                warn!(key, error = %e, "Overwriting undecodable record");
                Ok(Expect::Revision(kv.mod_revision))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn register(
        &self,
        name: &ActuatorName,
        key: &str,
        address: Address,
        metadata: ActuatorMetadata,
        lease: LeaseId,
        expect: Expect,
        deadline: &Deadline,
    ) -> RegistryResult<ActuatorRecord> {
        let now_ms = self.time.now_ms();
        let reservation = self.reserve(&address, name, lease);
        let mut registering = ActuatorRecord::new(name.clone(), address, metadata, lease, now_ms);
        let ops = vec![
            WriteOp::put(key, registering.encode()?, Some(lease), expect),
            reservation,
        ];

        let written = self
            .retry
            .run("commit", deadline, || self.store.commit(ops.clone()))
            .await;
        registering.revision = match written {
            Ok(revision) => revision,
            Err(RegistryError::PreconditionFailed { key: failed, .. }) if failed == key => {
                return Err(RegistryError::already_exists(name.as_str()));
            }
            Err(e) => return Err(self.reservation_failed(e, &registering.address).await),
        };
        self.commit(registering.clone());

        // The acknowledged lease write is what confirms the record
        let mut healthy = registering.with_status(ActuatorStatus::Healthy, now_ms);
        let value = healthy.encode()?;
        let registered_at = registering.revision;
        healthy.revision = self
            .retry
            .run("put", deadline, || {
                self.store.put(
                    key,
                    value.clone(),
                    Some(lease),
                    Expect::Revision(registered_at),
                )
            })
            .await?;
        self.commit(healthy.clone());

        debug_assert_eq!(healthy.version, actuary_core::Version::FIRST);
        Ok(healthy)
    }

    /// Undo a create after its lease was granted
    ///
    /// Revoking the lease deletes whatever was written under it. The revoke
    /// runs under its own short budget; a lease that cannot be revoked still
    /// expires after its TTL.
    async fn rollback_create(&self, name: &ActuatorName, lease: LeaseId) {
        self.revoke_quietly(lease).await;

        let ours = self
            .records
            .get(name)
            .is_some_and(|r| r.lease_id == Some(lease) && r.status != ActuatorStatus::Removed);
        if ours {
            let now_ms = self.time.now_ms();
            if let Some(transition) =
                self.records
                    .set_status(name, ActuatorStatus::Removed, None, now_ms)
            {
                self.events.publish_transition(&transition);
            }
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove an actuator
    ///
    /// Writes a tombstone and revokes the lease before marking the local
    /// record Removed. Returns the tombstone.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn delete(
        &self,
        name: &ActuatorName,
        timeout: Option<Duration>,
    ) -> RegistryResult<ActuatorRecord> {
        let deadline = self.deadline(timeout);
        let _guard = self.lock(name, &deadline).await?;
        let current = self.visible(name)?;

        let key = self.keys.key(name);
        let mut tombstone = current.tombstone(self.time.now_ms());
        let mut ops = vec![WriteOp::put(key, tombstone.encode()?, None, Expect::Any)];
        if current.status.is_live() {
            ops.extend(self.release(&current.address, name, &deadline).await?);
        }
        tombstone.revision = self
            .retry
            .run("commit", &deadline, || self.store.commit(ops.clone()))
            .await?;

        if let Some(lease) = current.lease_id {
            match self
                .retry
                .run("revoke_lease", &deadline, || self.store.revoke_lease(lease))
                .await
            {
                Ok(()) | Err(RegistryError::LeaseNotFound { .. }) => {}
                Err(e) => {
                    warn!(lease_id = lease, error = %e, "Lease revoke failed, lease will expire");
                }
            }
        }

        self.commit(tombstone.clone());
        info!(version = %tombstone.version, "Actuator deleted");
        Ok(tombstone)
    }

    // =========================================================================
    // Change
    // =========================================================================

    /// Update an actuator's address or metadata
    ///
    /// `patch.version` must equal the current version. A patch that is
    /// already fully reflected in the current record returns it unchanged.
    /// An Unhealthy record is still readable but refuses changes with
    /// `LeaseLost` (a conflict) until a keep-alive restores it.
    #[instrument(skip_all, fields(name = %name, version = %patch.version))]
    pub async fn change(
        &self,
        name: &ActuatorName,
        patch: ActuatorPatch,
        timeout: Option<Duration>,
    ) -> RegistryResult<ActuatorRecord> {
        let deadline = self.deadline(timeout);
        let _guard = self.lock(name, &deadline).await?;
        let current = self.visible(name)?;

        current
            .version
            .check(patch.version)
            .map_err(|m| RegistryError::version_conflict(name.as_str(), m))?;
        if patch.is_reflected_in(&current) {
            debug!("Patch already applied");
            return Ok((*current).clone());
        }
        if !current.status.is_live() {
            debug!(status = %current.status, "Lease lost, refusing change");
            return Err(RegistryError::LeaseLost {
                name: name.as_str().to_string(),
            });
        }

        let (address, metadata) = patch.resolve(&current)?;
        let _claim = if address != current.address {
            Some(self.records.claim_address(&address, name)?)
        } else {
            None
        };

        let mut next = ActuatorRecord {
            address,
            metadata,
            version: current.version.next(),
            updated_at_ms: self.time.now_ms(),
            ..(*current).clone()
        };
        let key = self.keys.key(name);
        let lease = current.lease_id;
        let mut ops = vec![WriteOp::put(
            key.clone(),
            next.encode()?,
            lease,
            Expect::Revision(current.revision),
        )];
        if let (true, Some(lease)) = (next.address != current.address, lease) {
            ops.extend(self.release(&current.address, name, &deadline).await?);
            ops.push(self.reserve(&next.address, name, lease));
        }

        let written = self
            .retry
            .run("commit", &deadline, || self.store.commit(ops.clone()))
            .await;
        next.revision = match written {
            Ok(revision) => revision,
            // Rewritten by another registry instance since our read
            Err(RegistryError::PreconditionFailed { key: failed, .. }) if failed == key => {
                return Err(RegistryError::version_conflict(
                    name.as_str(),
                    VersionMismatch {
                        presented: patch.version,
                        current: current.version,
                    },
                ));
            }
            Err(e) => return Err(self.reservation_failed(e, &next.address).await),
        };

        self.commit(next.clone());
        info!(version = %next.version, address = %next.address, "Actuator changed");
        Ok(next)
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    /// Renew an actuator's lease
    ///
    /// If the lease has already expired but the record is still within its
    /// grace period, a new lease is granted and the record re-written under
    /// it, returning the actuator to Healthy. Versions are not bumped.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn heartbeat(
        &self,
        name: &ActuatorName,
        timeout: Option<Duration>,
    ) -> RegistryResult<ActuatorRecord> {
        let deadline = self.deadline(timeout);
        let _guard = self.lock(name, &deadline).await?;
        let current = self.visible(name)?;

        if let (true, Some(lease)) = (current.status.is_live(), current.lease_id) {
            match self
                .retry
                .run("keep_alive", &deadline, || self.store.keep_alive(lease))
                .await
            {
                Ok(()) => return Ok((*current).clone()),
                Err(RegistryError::LeaseNotFound { .. }) => {
                    debug!(lease_id = lease, "Lease already expired");
                }
                Err(e) => return Err(e),
            }
        }

        self.relet(name, &current, &deadline).await
    }

    /// Put `current` back under a fresh lease
    async fn relet(
        &self,
        name: &ActuatorName,
        current: &ActuatorRecord,
        deadline: &Deadline,
    ) -> RegistryResult<ActuatorRecord> {
        let _claim = self.records.claim_address(&current.address, name)?;

        let ttl_ms = self.lease_ttl_ms;
        let lease = self
            .retry
            .run("grant_lease", deadline, || self.store.grant_lease(ttl_ms))
            .await?;

        let mut next = current.with_status(ActuatorStatus::Healthy, self.time.now_ms());
        next.lease_id = Some(lease);
        let key = self.keys.key(name);
        let ops = vec![
            WriteOp::put(key.clone(), next.encode()?, Some(lease), Expect::Absent),
            self.reserve(&next.address, name, lease),
        ];

        let written = self
            .retry
            .run("commit", deadline, || self.store.commit(ops.clone()))
            .await;
        match written {
            Ok(revision) => next.revision = revision,
            Err(e) => {
                warn!(lease_id = lease, error = %e, "Re-let failed, rolling back lease");
                self.revoke_quietly(lease).await;
                return Err(match e {
                    RegistryError::PreconditionFailed { key: failed, .. } if failed == key => {
                        RegistryError::already_exists(name.as_str())
                    }
                    other => self.reservation_failed(other, &next.address).await,
                });
            }
        }

        self.commit(next.clone());
        info!(lease_id = lease, "Actuator lease re-established");
        Ok(next)
    }
}

impl std::fmt::Debug for MembershipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipManager")
            .field("keys", &self.keys)
            .field("retry", &self.retry)
            .field("lease_ttl_ms", &self.lease_ttl_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory_store::MemoryCoordinationStore;
    use actuary_core::{ManualClock, Version};

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryCoordinationStore>,
        records: Arc<NodeRecordStore>,
        manager: MembershipManager,
    }

    fn harness() -> Harness {
        let mut config = ActuaryConfig::default();
        config.retry.backoff_initial_ms = 1;
        config.retry.backoff_max_ms = 5;

        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryCoordinationStore::new(clock.clone()));
        let records = Arc::new(NodeRecordStore::new());
        let manager = MembershipManager::new(
            &config,
            store.clone(),
            records.clone(),
            Arc::new(KeyedLocks::new()),
            clock.clone(),
            EventPublisher::new(16),
        );
        Harness {
            clock,
            store,
            records,
            manager,
        }
    }

    fn test_name(n: u32) -> ActuatorName {
        ActuatorName::new(format!("node-{}", n)).unwrap()
    }

    fn test_addr(n: u32) -> Address {
        Address::new(format!("10.0.0.{}", n), 9000).unwrap()
    }

    async fn create(h: &Harness, n: u32, addr: u32) -> RegistryResult<ActuatorRecord> {
        h.manager
            .create(test_name(n), test_addr(addr), ActuatorMetadata::default(), None)
            .await
    }

    #[tokio::test]
    async fn test_create_commits_healthy_v1() {
        let h = harness();
        let record = create(&h, 1, 1).await.unwrap();

        assert_eq!(record.version, Version::FIRST);
        assert_eq!(record.status, ActuatorStatus::Healthy);
        assert!(record.lease_id.is_some());

        let local = h.records.get(&test_name(1)).unwrap();
        assert_eq!(*local, record);
        assert!(h.store.get("/actuary/actuators/node-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_duplicate_name() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();

        let err = create(&h, 1, 2).await.unwrap_err();
        assert!(matches!(err, RegistryError::ActuatorAlreadyExists { .. }));
        // No leaked lease
        assert_eq!(h.store.lease_count().await, 1);
    }

    #[tokio::test]
    async fn test_create_address_collision() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();

        let err = create(&h, 2, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(h.records.get(&test_name(2)).is_none());
    }

    #[tokio::test]
    async fn test_create_retries_transient_failure() {
        let h = harness();
        h.store.fail_next_writes(2);

        let record = create(&h, 1, 1).await.unwrap();
        assert_eq!(record.status, ActuatorStatus::Healthy);
    }

    #[tokio::test]
    async fn test_create_rolls_back_lease_on_failure() {
        let h = harness();
        let name = test_name(1);
        let lease_before = h.store.lease_count().await;

        // Occupy the key under the manager's feet so the put conflicts
        h.store
            .put(
                "/actuary/actuators/node-1",
                b"{}".to_vec(),
                None,
                Expect::Any,
            )
            .await
            .unwrap();

        let err = h
            .manager
            .create(name.clone(), test_addr(1), ActuatorMetadata::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(h.store.lease_count().await, lease_before);
        assert!(h.records.get(&name).is_none());

        // The address was released
        assert!(create(&h, 2, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_times_out_and_leaves_no_lease() {
        let h = harness();
        h.store.fail_next_writes(100);

        let err = h
            .manager
            .create(
                test_name(1),
                test_addr(1),
                ActuatorMetadata::default(),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(h.store.lease_count().await, 0);
        assert!(h.records.get(&test_name(1)).is_none());
    }

    #[tokio::test]
    async fn test_delete_writes_tombstone_and_revokes() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();

        let tomb = h.manager.delete(&test_name(1), None).await.unwrap();
        assert_eq!(tomb.status, ActuatorStatus::Removed);
        assert_eq!(tomb.version.value(), 2);
        assert_eq!(h.store.lease_count().await, 0);

        let kv = h.store.get("/actuary/actuators/node-1").await.unwrap().unwrap();
        let stored = ActuatorRecord::decode(&kv.value, kv.mod_revision).unwrap();
        assert_eq!(stored.status, ActuatorStatus::Removed);

        let err = h.manager.delete(&test_name(1), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_then_reuse_name_and_address() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();
        h.manager.delete(&test_name(1), None).await.unwrap();

        let again = create(&h, 1, 1).await.unwrap();
        assert_eq!(again.version, Version::FIRST);
        assert_eq!(again.status, ActuatorStatus::Healthy);
    }

    #[tokio::test]
    async fn test_change_bumps_version() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();

        let patch = ActuatorPatch::at(Version::FIRST).with_host("10.0.0.2");
        let changed = h.manager.change(&test_name(1), patch.clone(), None).await.unwrap();
        assert_eq!(changed.version.value(), 2);
        assert_eq!(changed.address.host, "10.0.0.2");

        // Replay of the same call is stale
        let err = h.manager.change(&test_name(1), patch, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(h.records.get(&test_name(1)).unwrap().version.value(), 2);
    }

    #[tokio::test]
    async fn test_change_noop_returns_current() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();

        let patch = ActuatorPatch::at(Version::FIRST).with_port(9000);
        let same = h.manager.change(&test_name(1), patch, None).await.unwrap();
        assert_eq!(same.version, Version::FIRST);
    }

    #[tokio::test]
    async fn test_change_address_collision() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();
        create(&h, 2, 2).await.unwrap();

        let patch = ActuatorPatch::at(Version::FIRST).with_host("10.0.0.2");
        let err = h.manager.change(&test_name(1), patch, None).await.unwrap_err();
        assert!(matches!(err, RegistryError::AddressInUse { .. }));
    }

    #[tokio::test]
    async fn test_change_after_lease_loss_conflicts() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();
        h.records
            .set_status(&test_name(1), ActuatorStatus::Unhealthy, None, 2_000)
            .unwrap();

        let patch = ActuatorPatch::at(Version::FIRST).with_host("10.0.0.2");
        let err = h.manager.change(&test_name(1), patch, None).await.unwrap_err();
        assert!(matches!(err, RegistryError::LeaseLost { .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // Still readable, untouched
        let local = h.records.get(&test_name(1)).unwrap();
        assert_eq!(local.status, ActuatorStatus::Unhealthy);
        assert_eq!(local.version, Version::FIRST);
    }

    #[tokio::test]
    async fn test_change_missing() {
        let h = harness();
        let err = h
            .manager
            .change(&test_name(9), ActuatorPatch::at(Version::FIRST), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    async fn reservation(h: &Harness, addr: u32) -> Option<String> {
        h.store
            .get(&format!("/actuary/addresses/10.0.0.{}:9000", addr))
            .await
            .unwrap()
            .map(|kv| String::from_utf8(kv.value).unwrap())
    }

    #[tokio::test]
    async fn test_reservation_follows_record() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();
        assert_eq!(reservation(&h, 1).await.as_deref(), Some("node-1"));

        let patch = ActuatorPatch::at(Version::FIRST).with_host("10.0.0.2");
        h.manager.change(&test_name(1), patch, None).await.unwrap();
        assert_eq!(reservation(&h, 1).await, None);
        assert_eq!(reservation(&h, 2).await.as_deref(), Some("node-1"));

        h.manager.delete(&test_name(1), None).await.unwrap();
        assert_eq!(reservation(&h, 2).await, None);
    }

    #[tokio::test]
    async fn test_create_rejects_address_reserved_elsewhere() {
        let h = harness();
        let foreign = h.store.grant_lease(10_000).await.unwrap();
        h.store
            .put(
                "/actuary/addresses/10.0.0.1:9000",
                b"node-7".to_vec(),
                Some(foreign),
                Expect::Absent,
            )
            .await
            .unwrap();

        let err = create(&h, 1, 1).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::AddressInUse { ref holder, .. } if holder == "node-7"
        ));
        assert!(h.store.get("/actuary/actuators/node-1").await.unwrap().is_none());
        assert_eq!(h.store.lease_count().await, 1);
    }

    #[tokio::test]
    async fn test_lapsed_lease_frees_reservation() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();

        h.clock.advance(11_000);
        assert_eq!(h.store.expire_leases().await, 1);
        assert_eq!(reservation(&h, 1).await, None);

        // Re-let takes the address back
        h.manager.heartbeat(&test_name(1), None).await.unwrap();
        assert_eq!(reservation(&h, 1).await.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn test_heartbeat_extends_lease() {
        let h = harness();
        create(&h, 1, 1).await.unwrap();

        for _ in 0..5 {
            h.clock.advance(6_000);
            h.manager.heartbeat(&test_name(1), None).await.unwrap();
        }
        assert_eq!(h.store.expire_leases().await, 0);
        assert!(h.store.get("/actuary/actuators/node-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_after_expiry_relets() {
        let h = harness();
        let created = create(&h, 1, 1).await.unwrap();

        h.clock.advance(11_000);
        assert_eq!(h.store.expire_leases().await, 1);

        let renewed = h.manager.heartbeat(&test_name(1), None).await.unwrap();
        assert_eq!(renewed.status, ActuatorStatus::Healthy);
        assert_ne!(renewed.lease_id, created.lease_id);
        assert_eq!(renewed.version, created.version);
        assert!(h.store.get("/actuary/actuators/node-1").await.unwrap().is_some());
    }
}
