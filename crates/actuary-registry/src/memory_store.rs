//! In-memory coordination store
//!
//! Single-process implementation of `CoordinationStore` with etcd-like
//! semantics: a global revision counter, prefix watches, TTL leases whose
//! expiry deletes attached keys, and conditional writes.
//!
//! Carries deterministic fault injection for tests: failing writes, added
//! latency, an unavailable switch and severing all watch streams.
//!
//! TigerStyle: All state changes are explicit, deterministic ordering.

use crate::coordination::{
    CoordinationStore, Expect, KeyValue, LeaseId, Listing, Revision, WatchEvent, WatchStream,
    WriteOp,
};
use crate::error::{RegistryError, RegistryResult};
use actuary_core::constants::WATCH_CHANNEL_CAPACITY;
use actuary_core::TimeProvider;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl_ms: u64,
    expires_at_ms: u64,
    keys: BTreeSet<String>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct MemoryState {
    kvs: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseState>,
    revision: Revision,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
}

impl MemoryState {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    /// Deliver an event; watchers that are gone or full are dropped
    fn emit(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if !event.key().starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            match w.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(prefix = %w.prefix, "Watcher overflowed, cancelling");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn check(&self, key: &str, expect: Expect) -> RegistryResult<()> {
        let current = self.kvs.get(key).map(|v| v.mod_revision);
        let holds = match expect {
            Expect::Any => true,
            Expect::Absent => current.is_none(),
            Expect::Revision(r) => current == Some(r),
        };
        if holds {
            Ok(())
        } else {
            Err(RegistryError::PreconditionFailed {
                key: key.to_string(),
                current,
            })
        }
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> RegistryResult<()> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => {
                Err(RegistryError::LeaseNotFound { lease_id: id })
            }
            _ => Ok(()),
        }
    }

    fn detach(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(id) = lease {
            if let Some(state) = self.leases.get_mut(&id) {
                state.keys.remove(key);
            }
        }
    }

    /// Store `value` at `revision`; lease and preconditions already checked
    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>, revision: Revision) {
        let previous_lease = self.kvs.get(key).and_then(|v| v.lease);
        self.detach(key, previous_lease);
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }

        self.kvs.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                mod_revision: revision,
                lease,
            },
        );
        self.emit(WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value,
            mod_revision: revision,
            lease,
        }));
    }

    /// Remove `key` at `revision`; false if it was absent
    fn erase(&mut self, key: &str, revision: Revision) -> bool {
        let Some(old) = self.kvs.remove(key) else {
            return false;
        };
        self.detach(key, old.lease);
        self.emit(WatchEvent::Delete {
            key: key.to_string(),
            revision,
        });
        true
    }

    fn remove_key(&mut self, key: &str) -> Option<Revision> {
        if !self.kvs.contains_key(key) {
            return None;
        }
        let revision = self.next_revision();
        self.erase(key, revision);
        Some(revision)
    }

    /// Drop a lease; its keys all go at one revision
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(state) = self.leases.remove(&id) else {
            return false;
        };
        if !state.keys.is_empty() {
            let revision = self.next_revision();
            for key in state.keys {
                self.erase(&key, revision);
            }
        }
        true
    }

    fn expire_due(&mut self, now_ms: u64) -> usize {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at_ms <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            trace!(lease_id = id, "Lease expired");
            self.drop_lease(*id);
        }
        due.len()
    }
}

/// In-memory coordination store
#[derive(Debug)]
pub struct MemoryCoordinationStore {
    state: Mutex<MemoryState>,
    time: Arc<dyn TimeProvider>,
    fail_writes: AtomicU32,
    latency_ms: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryCoordinationStore {
    /// Create an empty store whose leases expire against `time`
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_lease_id: 1,
                ..Default::default()
            }),
            time,
            fail_writes: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Expire every lease whose TTL has passed, deleting attached keys
    ///
    /// Returns the number of leases expired.
    pub async fn expire_leases(&self) -> usize {
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms)
    }

    /// Current store revision
    pub async fn revision(&self) -> Revision {
        self.state.lock().await.revision
    }

    /// Number of live leases
    pub async fn lease_count(&self) -> usize {
        self.state.lock().await.leases.len()
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Fail the next `count` mutating calls with `StoreUnavailable`
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `ms` (real time)
    pub fn set_latency_ms(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Fail every call, including new watches, until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sever every open watch stream
    pub async fn disconnect_watchers(&self) {
        let mut state = self.state.lock().await;
        debug!(count = state.watchers.len(), "Disconnecting watchers");
        state.watchers.clear();
    }

    async fn enter(&self, write: bool) -> RegistryResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::store("memory store unavailable"));
        }

        if write {
            let injected = self
                .fail_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(RegistryError::store("injected write failure"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        expect: Expect,
    ) -> RegistryResult<Revision> {
        self.enter(true).await?;
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms);

        state.check_lease(lease)?;
        state.check(key, expect)?;

        let revision = state.next_revision();
        state.write(key, value, lease, revision);
        Ok(revision)
    }

    async fn delete(&self, key: &str, expect: Expect) -> RegistryResult<Option<Revision>> {
        self.enter(true).await?;
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms);

        if !state.kvs.contains_key(key) {
            if let Expect::Revision(_) = expect {
                state.check(key, expect)?;
            }
            return Ok(None);
        }
        state.check(key, expect)?;
        Ok(state.remove_key(key))
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> RegistryResult<Revision> {
        debug_assert!(
            ops.iter()
                .map(WriteOp::key)
                .collect::<BTreeSet<_>>()
                .len()
                == ops.len(),
            "commit keys must be distinct"
        );
        self.enter(true).await?;
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms);

        for op in &ops {
            if let WriteOp::Put { lease, .. } = op {
                state.check_lease(*lease)?;
            }
            state.check(op.key(), op.expect())?;
        }

        let changes = ops.iter().any(|op| match op {
            WriteOp::Put { .. } => true,
            WriteOp::Delete { key, .. } => state.kvs.contains_key(key),
        });
        if !changes {
            return Ok(state.revision);
        }

        let revision = state.next_revision();
        for op in ops {
            match op {
                WriteOp::Put {
                    key, value, lease, ..
                } => state.write(&key, value, lease, revision),
                WriteOp::Delete { key, .. } => {
                    state.erase(&key, revision);
                }
            }
        }
        Ok(revision)
    }

    async fn get(&self, key: &str) -> RegistryResult<Option<KeyValue>> {
        self.enter(false).await?;
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms);

        Ok(state.kvs.get(key).map(|v| KeyValue {
            key: key.to_string(),
            value: v.value.clone(),
            mod_revision: v.mod_revision,
            lease: v.lease,
        }))
    }

    async fn list(&self, prefix: &str) -> RegistryResult<Listing> {
        self.enter(false).await?;
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms);

        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
                mod_revision: v.mod_revision,
                lease: v.lease,
            })
            .collect();
        Ok(Listing {
            kvs,
            revision: state.revision,
        })
    }

    async fn watch(&self, prefix: &str) -> RegistryResult<WatchStream> {
        self.enter(false).await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut state = self.state.lock().await;
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }

    async fn grant_lease(&self, ttl_ms: u64) -> RegistryResult<LeaseId> {
        self.enter(true).await?;
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms);

        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl_ms,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<()> {
        self.enter(true).await?;
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms);

        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at_ms = now_ms.saturating_add(l.ttl_ms);
                Ok(())
            }
            None => Err(RegistryError::LeaseNotFound { lease_id: lease }),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> RegistryResult<()> {
        self.enter(true).await?;
        let now_ms = self.time.now_ms();
        let mut state = self.state.lock().await;
        state.expire_due(now_ms);

        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(RegistryError::LeaseNotFound { lease_id: lease })
        }
    }
}
