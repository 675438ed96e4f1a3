//! Actuary Core
//!
//! Core types, errors, configuration and constants for the Actuary executor
//! registry.
//!
//! # Overview
//!
//! Actuary keeps the authoritative record of which worker nodes (actuators)
//! exist in a task-scheduling cluster, where they can be reached, and whether
//! they may receive work. This crate holds the pieces shared by the registry
//! engine and the server binary.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `ACTUATOR_NAME_LENGTH_BYTES_MAX`)
//! - Assertions on preconditions and postconditions
//! - No recursion (bounded iteration only)

pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod metrics;
pub mod occ;
pub mod telemetry;

pub use config::{
    ActuaryConfig, LeaseConfig, RegistryConfig, ResyncConfig, RetryConfig, StoreBackend,
    StoreConfig,
};
pub use constants::*;
pub use error::{Error, Result};
pub use io::{ManualClock, TimeProvider, WallClockTime};
pub use occ::{Version, VersionMismatch};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
