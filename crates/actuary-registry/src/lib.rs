//! Actuary Registry
//!
//! Executor membership and liveness for task-scheduling clusters.
//!
//! # Overview
//!
//! The registry provides:
//! - Actuator create/change/delete with name and address uniqueness
//! - Lease-based failure detection with a grace period
//! - Cache-only healthy-address listing for the dispatcher hot path
//! - Automatic resynchronization after a lost watch
//! - Multiple coordination store backends (Memory, etcd)
//!
//! # Architecture
//!
//! ```text
//!   RegistryApi ──> MembershipManager ──┐ write-through
//!        │                              ├──────────────> CoordinationStore
//!        │          LivenessTracker <───┘ watch / list        (etcd)
//!        │                │
//!        ▼                ▼
//!   QueryService ──> NodeRecordStore (ArcSwap snapshot)
//! ```

pub mod actuator;
pub mod api;
pub mod coordination;
pub mod error;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod events;
pub mod liveness;
pub mod locks;
pub mod membership;
pub mod memory_store;
pub mod query;
pub mod record_store;
pub mod registry;
pub mod retry;

pub use actuator::{
    ActuatorMetadata, ActuatorName, ActuatorPatch, ActuatorRecord, ActuatorStatus, Address,
};
pub use api::{
    ActuatorResponse, ActuatorService, ChangeActuatorRequest, CreateActuatorRequest,
    DeleteActuatorRequest, GetActuatorRequest, KeepAliveActuatorRequest, RegistryApi, ResultCode,
};
pub use coordination::{
    CoordinationStore, Expect, KeySpace, KeyValue, LeaseId, Listing, Revision, WatchEvent,
    WatchStream, WriteOp,
};
pub use error::{ErrorKind, RegistryError, RegistryResult};
#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinationStore;
pub use events::{EventPublisher, MembershipEvent};
pub use liveness::{LivenessTask, LivenessTracker, SweepStats};
pub use locks::KeyedLocks;
pub use membership::MembershipManager;
pub use memory_store::MemoryCoordinationStore;
pub use query::{Observed, QueryService};
pub use record_store::{NodeRecordStore, RecordSnapshot};
pub use registry::ActuatorRegistry;
pub use retry::{Deadline, RetryPolicy};
