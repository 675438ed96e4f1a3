//! Coordination Store Abstraction
//!
//! Trait boundary over the external strongly-consistent key/value service
//! that owns the durable, cluster-wide actuator records. The registry's
//! in-memory state is a projection of what this store reports.
//!
//! Implementations: `MemoryCoordinationStore` (single process, tests) and
//! `EtcdCoordinationStore` (`etcd` feature).
//!
//! TigerStyle: Explicit trait bounds, explicit error handling.

use crate::actuator::{ActuatorName, Address};
use crate::error::RegistryResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Opaque lease handle issued by the store
pub type LeaseId = i64;

/// Store-wide modification counter
pub type Revision = u64;

/// Precondition for a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Unconditional
    Any,
    /// Key must not exist (create-if-absent)
    Absent,
    /// Key must exist and was last modified at this revision
    Revision(Revision),
}

/// One write inside an atomic `commit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        expect: Expect,
    },
    /// Deleting an absent key under `Expect::Any` is a no-op
    Delete { key: String, expect: Expect },
}

impl WriteOp {
    pub fn put(
        key: impl Into<String>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        expect: Expect,
    ) -> Self {
        Self::Put {
            key: key.into(),
            value,
            lease,
            expect,
        }
    }

    pub fn delete(key: impl Into<String>, expect: Expect) -> Self {
        Self::Delete {
            key: key.into(),
            expect,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    pub fn expect(&self) -> Expect {
        match self {
            Self::Put { expect, .. } | Self::Delete { expect, .. } => *expect,
        }
    }
}

/// A stored key/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

/// Result of a prefix listing
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub kvs: Vec<KeyValue>,
    /// Store revision the listing was taken at
    pub revision: Revision,
}

/// Change notification from a prefix watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    /// Explicit delete or lease expiry
    Delete { key: String, revision: Revision },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> Revision {
        match self {
            Self::Put(kv) => kv.mod_revision,
            Self::Delete { revision, .. } => *revision,
        }
    }
}

/// Ordered stream of watch events
///
/// The stream ending (`next()` returning `None`) means the watch was lost;
/// the consumer must resynchronize before trusting its view again.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::Receiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: mpsc::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once disconnected
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

// =============================================================================
// CoordinationStore Trait
// =============================================================================

/// Backend trait for the coordination store
///
/// All methods are safe for concurrent use through a shared `Arc`.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write `value` under `key`, optionally attached to `lease`
    ///
    /// Fails with `PreconditionFailed` if `expect` does not hold and with
    /// `LeaseNotFound` if the lease is unknown. Returns the new revision.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        expect: Expect,
    ) -> RegistryResult<Revision>;

    /// Delete `key` if `expect` holds; returns the delete revision, or
    /// `None` if the key did not exist
    async fn delete(&self, key: &str, expect: Expect) -> RegistryResult<Option<Revision>>;

    /// Apply every op or none
    ///
    /// All preconditions and leases are checked before anything is written;
    /// the first one that fails is reported as `PreconditionFailed` (naming
    /// its key) or `LeaseNotFound`. Every write lands at the one returned
    /// revision. Keys must be distinct.
    async fn commit(&self, ops: Vec<WriteOp>) -> RegistryResult<Revision>;

    /// Read a single key
    async fn get(&self, key: &str) -> RegistryResult<Option<KeyValue>>;

    /// Read every key under `prefix`
    async fn list(&self, prefix: &str) -> RegistryResult<Listing>;

    /// Subscribe to changes under `prefix`, starting after the current revision
    async fn watch(&self, prefix: &str) -> RegistryResult<WatchStream>;

    /// Grant a lease that expires after `ttl_ms` without keep-alive
    async fn grant_lease(&self, ttl_ms: u64) -> RegistryResult<LeaseId>;

    /// Renew a lease for another TTL
    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<()>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, lease: LeaseId) -> RegistryResult<()>;
}

// =============================================================================
// Key Schema
// =============================================================================

/// Maps actuator names and addresses onto store keys
///
/// ```text
/// /actuary/actuators/{name}          -> ActuatorRecord (JSON)
/// /actuary/addresses/{host}:{port}   -> holder name, under the holder's lease
/// ```
///
/// The address reservations live in a sibling of the record prefix so the
/// record watch never sees them.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    addresses: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        debug_assert!(prefix.starts_with('/') && prefix.ends_with('/'));
        let parent = prefix
            .trim_end_matches('/')
            .rsplit_once('/')
            .map(|(parent, _)| parent)
            .unwrap_or("");
        let addresses = format!("{}/addresses/", parent);
        debug_assert_ne!(addresses, prefix);
        Self { prefix, addresses }
    }

    /// Prefix of the address reservations
    pub fn address_prefix(&self) -> &str {
        &self.addresses
    }

    /// Reservation key for `address`
    pub fn address_key(&self, address: &Address) -> String {
        format!("{}{}:{}", self.addresses, address.host, address.port)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store key for an actuator
    pub fn key(&self, name: &ActuatorName) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Actuator name encoded in `key`, if it belongs to this key space
    pub fn name_of(&self, key: &str) -> Option<ActuatorName> {
        key.strip_prefix(&self.prefix)
            .and_then(|rest| ActuatorName::new(rest).ok())
    }
}
