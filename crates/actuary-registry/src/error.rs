//! Registry error types
//!
//! TigerStyle: Explicit error variants with context.

use actuary_core::VersionMismatch;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error classification surfaced to API callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    /// Stale version
    Conflict,
    /// Coordination store did not answer within the deadline
    Timeout,
    /// Coordination store unreachable or watch disconnected
    StoreUnavailable,
    /// Malformed name, address or patch
    Invalid,
    Internal,
}

/// Registry-specific errors
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// Invalid actuator name
    #[error("invalid actuator name: {name}, reason: {reason}")]
    InvalidName { name: String, reason: String },

    /// Invalid network address
    #[error("invalid actuator address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Metadata outside limits
    #[error("invalid actuator metadata: {reason}")]
    InvalidMetadata { reason: String },

    /// No live record with that name
    #[error("actuator not found: {name}")]
    ActuatorNotFound { name: String },

    /// A live record with that name already exists
    #[error("actuator already exists: {name}")]
    ActuatorAlreadyExists { name: String },

    /// Another live record is bound to the address
    #[error("address {address} already in use by actuator {holder}")]
    AddressInUse { address: String, holder: String },

    /// Version conflict during OCC write
    #[error("version conflict for actuator {name}: expected {expected}, found {found}")]
    VersionConflict {
        name: String,
        expected: u64,
        found: u64,
    },

    /// Record is visible but its lease lapsed; only a keep-alive revives it
    #[error("actuator {name} lost its lease, renew it before changing")]
    LeaseLost { name: String },

    /// Conditional store write rejected (key absent/present/moved on)
    #[error("precondition failed on key {key}, current revision {current:?}")]
    PreconditionFailed { key: String, current: Option<u64> },

    /// Deadline elapsed before the store answered
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Coordination store failure
    #[error("coordination store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// Lease unknown to the store (expired or revoked)
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: i64 },

    /// Internal registry error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RegistryError {
    /// Create an actuator not found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::ActuatorNotFound { name: name.into() }
    }

    /// Change presented a version other than the record's
    pub fn version_conflict(name: impl Into<String>, mismatch: VersionMismatch) -> Self {
        Self::VersionConflict {
            name: name.into(),
            expected: mismatch.presented.value(),
            found: mismatch.current.value(),
        }
    }

    /// Create an actuator already exists error
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::ActuatorAlreadyExists { name: name.into() }
    }

    /// Create a store unavailable error
    pub fn store(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName { .. }
            | Self::InvalidAddress { .. }
            | Self::InvalidMetadata { .. } => ErrorKind::Invalid,
            Self::ActuatorNotFound { .. } | Self::LeaseNotFound { .. } => ErrorKind::NotFound,
            Self::ActuatorAlreadyExists { .. } | Self::AddressInUse { .. } => {
                ErrorKind::AlreadyExists
            }
            Self::VersionConflict { .. }
            | Self::LeaseLost { .. }
            | Self::PreconditionFailed { .. } => ErrorKind::Conflict,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error indicates a retriable condition
    ///
    /// Conflicts are never retried; the caller must re-read and resubmit.
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::StoreUnavailable
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("record codec: {}", err))
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::not_found("node-1");
        assert!(err.to_string().contains("node-1"));

        let err = RegistryError::AddressInUse {
            address: "10.0.0.1:9000".into(),
            holder: "node-1".into(),
        };
        assert!(err.to_string().contains("10.0.0.1:9000"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(RegistryError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(
            RegistryError::AddressInUse {
                address: "a".into(),
                holder: "b".into()
            }
            .kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            RegistryError::VersionConflict {
                name: "x".into(),
                expected: 1,
                found: 2
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            RegistryError::LeaseLost { name: "x".into() }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            RegistryError::timeout("create", 10).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_error_retriable() {
        assert!(RegistryError::store("connection reset").is_retriable());
        assert!(!RegistryError::not_found("x").is_retriable());
        assert!(!RegistryError::timeout("put", 5).is_retriable());
        assert!(!RegistryError::VersionConflict {
            name: "x".into(),
            expected: 1,
            found: 2
        }
        .is_retriable());
    }
}
