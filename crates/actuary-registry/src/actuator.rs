//! Actuator types and identification
//!
//! TigerStyle: Explicit record lifecycle with validated identifiers.

use crate::coordination::{LeaseId, Revision};
use crate::error::{RegistryError, RegistryResult};
use actuary_core::constants::{
    ACTUATOR_HOST_LENGTH_BYTES_MAX, ACTUATOR_NAME_LENGTH_BYTES_MAX, ACTUATOR_TAGS_COUNT_MAX,
    ACTUATOR_TAG_LENGTH_BYTES_MAX,
};
use actuary_core::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique name of an actuator (executor node)
///
/// Immutable after creation; primary key of the registry.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActuatorName(String);

impl ActuatorName {
    /// Create a new ActuatorName with validation
    ///
    /// # Errors
    /// Returns error if name is empty, too long, or contains characters other
    /// than alphanumerics, dashes, underscores and dots.
    pub fn new(name: impl Into<String>) -> RegistryResult<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(RegistryError::InvalidName {
                name,
                reason: "actuator name cannot be empty".into(),
            });
        }

        if name.len() > ACTUATOR_NAME_LENGTH_BYTES_MAX {
            return Err(RegistryError::InvalidName {
                reason: format!(
                    "actuator name length {} exceeds limit {}",
                    name.len(),
                    ACTUATOR_NAME_LENGTH_BYTES_MAX
                ),
                name,
            });
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

        if !valid {
            return Err(RegistryError::InvalidName {
                name,
                reason: "actuator name contains invalid characters".into(),
            });
        }

        Ok(Self(name))
    }

    /// Get the name as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ActuatorName {
    type Error = RegistryError;

    fn try_from(value: String) -> RegistryResult<Self> {
        Self::new(value)
    }
}

impl From<ActuatorName> for String {
    fn from(name: ActuatorName) -> Self {
        name.0
    }
}

impl fmt::Display for ActuatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ActuatorName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Network address an actuator accepts work on
///
/// Decoding goes through `Address::new`, so a stored record can never hand
/// the dispatcher an empty host or port 0.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "RawAddress")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize)]
struct RawAddress {
    host: String,
    port: u16,
}

impl TryFrom<RawAddress> for Address {
    type Error = RegistryError;

    fn try_from(raw: RawAddress) -> RegistryResult<Self> {
        Self::new(raw.host, raw.port)
    }
}

impl Address {
    /// Create a validated address
    pub fn new(host: impl Into<String>, port: u16) -> RegistryResult<Self> {
        let host = host.into();
        let display = format!("{}:{}", host, port);

        if host.is_empty() {
            return Err(RegistryError::InvalidAddress {
                address: display,
                reason: "host cannot be empty".into(),
            });
        }

        if host.len() > ACTUATOR_HOST_LENGTH_BYTES_MAX {
            return Err(RegistryError::InvalidAddress {
                address: display,
                reason: format!(
                    "host length {} exceeds limit {}",
                    host.len(),
                    ACTUATOR_HOST_LENGTH_BYTES_MAX
                ),
            });
        }

        // hostnames, IPv4 and bare IPv6 literals
        let valid = host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':');
        if !valid {
            return Err(RegistryError::InvalidAddress {
                address: display,
                reason: "host contains invalid characters".into(),
            });
        }

        if port == 0 {
            return Err(RegistryError::InvalidAddress {
                address: display,
                reason: "port cannot be 0".into(),
            });
        }

        Ok(Self { host, port })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Actuator status in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorStatus {
    /// Record written, lease not yet confirmed
    Registering,
    /// Lease confirmed and alive
    Healthy,
    /// Lease lost, within grace period
    Unhealthy,
    /// Deleted or expired; terminal
    Removed,
}

impl ActuatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registering => "registering",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Removed => "removed",
        }
    }

    /// Check if the actuator may receive work
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if the record holds its name and address
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Registering | Self::Healthy)
    }

    /// Check if the record is visible to Get/List
    pub fn is_visible(&self) -> bool {
        !matches!(self, Self::Removed)
    }

    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: ActuatorStatus) -> bool {
        use ActuatorStatus::*;
        matches!(
            (self, next),
            (Registering, Healthy)
                | (Registering, Unhealthy)
                | (Registering, Removed)
                | (Healthy, Unhealthy)
                | (Healthy, Removed)
                | (Unhealthy, Healthy)
                | (Unhealthy, Removed)
        )
    }
}

impl fmt::Display for ActuatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling hints, opaque to the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ActuatorMetadata {
    /// Validate tag limits
    pub fn validate(&self) -> RegistryResult<()> {
        if self.tags.len() > ACTUATOR_TAGS_COUNT_MAX {
            return Err(RegistryError::InvalidMetadata {
                reason: format!(
                    "tag count {} exceeds limit {}",
                    self.tags.len(),
                    ACTUATOR_TAGS_COUNT_MAX
                ),
            });
        }
        for (k, v) in &self.tags {
            if k.is_empty()
                || k.len() > ACTUATOR_TAG_LENGTH_BYTES_MAX
                || v.len() > ACTUATOR_TAG_LENGTH_BYTES_MAX
            {
                return Err(RegistryError::InvalidMetadata {
                    reason: format!("tag {} has invalid length", k),
                });
            }
        }
        Ok(())
    }
}

/// One registered actuator
///
/// Serialized as JSON into the coordination store. `revision` is the store's
/// modification revision and is filled in on decode, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorRecord {
    pub name: ActuatorName,
    pub address: Address,
    #[serde(default)]
    pub metadata: ActuatorMetadata,
    pub status: ActuatorStatus,
    #[serde(default)]
    pub lease_id: Option<LeaseId>,
    pub version: Version,
    #[serde(skip)]
    pub revision: Revision,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub unhealthy_since_ms: Option<u64>,
    #[serde(default)]
    pub removed_at_ms: Option<u64>,
}

impl ActuatorRecord {
    /// Build a fresh record in Registering state
    pub fn new(
        name: ActuatorName,
        address: Address,
        metadata: ActuatorMetadata,
        lease_id: LeaseId,
        now_ms: u64,
    ) -> Self {
        Self {
            name,
            address,
            metadata,
            status: ActuatorStatus::Registering,
            lease_id: Some(lease_id),
            version: Version::FIRST,
            revision: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            unhealthy_since_ms: None,
            removed_at_ms: None,
        }
    }

    /// Encode for the coordination store
    pub fn encode(&self) -> RegistryResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a stored value, stamping the store revision
    pub fn decode(bytes: &[u8], revision: Revision) -> RegistryResult<Self> {
        let mut record: Self = serde_json::from_slice(bytes)?;
        record.revision = revision;
        Ok(record)
    }

    /// Tombstone for an explicit delete (version bumped, lease dropped)
    pub fn tombstone(&self, now_ms: u64) -> Self {
        Self {
            status: ActuatorStatus::Removed,
            lease_id: None,
            version: self.version.next(),
            updated_at_ms: now_ms,
            removed_at_ms: Some(now_ms),
            ..self.clone()
        }
    }

    /// Copy with a new status, stamping liveness timestamps
    pub fn with_status(&self, status: ActuatorStatus, now_ms: u64) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at_ms = now_ms;
        match status {
            ActuatorStatus::Unhealthy => {
                next.unhealthy_since_ms = Some(self.unhealthy_since_ms.unwrap_or(now_ms))
            }
            ActuatorStatus::Removed => {
                next.removed_at_ms = Some(self.removed_at_ms.unwrap_or(now_ms));
            }
            ActuatorStatus::Registering | ActuatorStatus::Healthy => {
                next.unhealthy_since_ms = None;
            }
        }
        next
    }
}

/// Caller-supplied update for ChangeActuator
///
/// `version` is the version the caller last read. Absent fields stay as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorPatch {
    pub version: Version,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
}

impl ActuatorPatch {
    /// Start a patch against `version`
    pub fn at(version: Version) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Resulting address and metadata when applied to `record`
    pub fn resolve(&self, record: &ActuatorRecord) -> RegistryResult<(Address, ActuatorMetadata)> {
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| record.address.host.clone());
        let port = self.port.unwrap_or(record.address.port);
        let address = Address::new(host, port)?;

        let mut metadata = record.metadata.clone();
        if let Some(weight) = self.weight {
            metadata.weight = Some(weight);
        }
        if let Some(tags) = &self.tags {
            metadata.tags = tags.clone();
        }
        metadata.validate()?;

        Ok((address, metadata))
    }

    /// True when applying the patch would not change `record`
    pub fn is_reflected_in(&self, record: &ActuatorRecord) -> bool {
        self.host.as_ref().map_or(true, |h| *h == record.address.host)
            && self.port.map_or(true, |p| p == record.address.port)
            && self.weight.map_or(true, |w| Some(w) == record.metadata.weight)
            && self.tags.as_ref().map_or(true, |t| *t == record.metadata.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record() -> ActuatorRecord {
        ActuatorRecord::new(
            ActuatorName::new("node-1").unwrap(),
            Address::new("10.0.0.1", 9000).unwrap(),
            ActuatorMetadata::default(),
            7,
            1000,
        )
    }

    #[test]
    fn test_actuator_name_valid() {
        let name = ActuatorName::new("node-1").unwrap();
        assert_eq!(name.as_str(), "node-1");

        let name = ActuatorName::new("executor_01.zone-a").unwrap();
        assert_eq!(name.as_str(), "executor_01.zone-a");
    }

    #[test]
    fn test_actuator_name_invalid() {
        assert!(ActuatorName::new("").is_err());
        assert!(ActuatorName::new("a".repeat(ACTUATOR_NAME_LENGTH_BYTES_MAX + 1)).is_err());
        assert!(ActuatorName::new("node/1").is_err());
        assert!(ActuatorName::new("node 1").is_err());
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::new("10.0.0.1", 9000).is_ok());
        assert!(Address::new("worker-3.cluster.local", 80).is_ok());
        assert!(Address::new("", 9000).is_err());
        assert!(Address::new("10.0.0.1", 0).is_err());
        assert!(Address::new("bad host", 9000).is_err());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new("10.0.0.1", 9000).unwrap().to_string(), "10.0.0.1:9000");
        assert_eq!(Address::new("::1", 9000).unwrap().to_string(), "[::1]:9000");
    }

    #[test]
    fn test_status_transitions() {
        use ActuatorStatus::*;
        assert!(Registering.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Healthy));
        assert!(Unhealthy.can_transition_to(Removed));

        // Removed is terminal
        assert!(!Removed.can_transition_to(Healthy));
        assert!(!Removed.can_transition_to(Removed));
        assert!(!Healthy.can_transition_to(Registering));
    }

    #[test]
    fn test_status_predicates() {
        assert!(ActuatorStatus::Healthy.is_schedulable());
        assert!(!ActuatorStatus::Registering.is_schedulable());
        assert!(ActuatorStatus::Registering.is_live());
        assert!(!ActuatorStatus::Unhealthy.is_live());
        assert!(ActuatorStatus::Unhealthy.is_visible());
        assert!(!ActuatorStatus::Removed.is_visible());
    }

    #[test]
    fn test_record_codec_skips_revision() {
        let mut record = test_record();
        record.revision = 42;

        let bytes = record.encode().unwrap();
        let decoded = ActuatorRecord::decode(&bytes, 99).unwrap();
        assert_eq!(decoded.revision, 99);
        assert_eq!(decoded.name, record.name);
        assert_eq!(decoded.version, Version::FIRST);
    }

    #[test]
    fn test_record_decode_rejects_invalid_name() {
        let bytes = br#"{"name":"bad name","address":{"host":"h","port":1},"status":"healthy","version":1,"created_at_ms":0,"updated_at_ms":0}"#;
        assert!(ActuatorRecord::decode(bytes, 1).is_err());
    }

    #[test]
    fn test_record_decode_rejects_invalid_address() {
        let empty_host = br#"{"name":"node-9","address":{"host":"","port":9000},"status":"healthy","version":1,"created_at_ms":0,"updated_at_ms":0}"#;
        assert!(ActuatorRecord::decode(empty_host, 1).is_err());

        let zero_port = br#"{"name":"node-9","address":{"host":"10.0.0.9","port":0},"status":"healthy","version":1,"created_at_ms":0,"updated_at_ms":0}"#;
        assert!(ActuatorRecord::decode(zero_port, 1).is_err());

        let ok = br#"{"name":"node-9","address":{"host":"10.0.0.9","port":9000},"status":"healthy","version":1,"created_at_ms":0,"updated_at_ms":0}"#;
        assert!(ActuatorRecord::decode(ok, 1).is_ok());
    }

    #[test]
    fn test_tombstone() {
        let record = test_record();
        let tomb = record.tombstone(2000);
        assert_eq!(tomb.status, ActuatorStatus::Removed);
        assert_eq!(tomb.version.value(), 2);
        assert!(tomb.lease_id.is_none());
        assert_eq!(tomb.removed_at_ms, Some(2000));
    }

    #[test]
    fn test_with_status_keeps_first_unhealthy_timestamp() {
        let record = test_record();
        let sick = record.with_status(ActuatorStatus::Unhealthy, 5000);
        let still_sick = sick.with_status(ActuatorStatus::Unhealthy, 6000);
        assert_eq!(still_sick.unhealthy_since_ms, Some(5000));
        assert_eq!(still_sick.version, record.version);

        let healed = still_sick.with_status(ActuatorStatus::Healthy, 7000);
        assert_eq!(healed.unhealthy_since_ms, None);
    }

    #[test]
    fn test_patch_resolve_and_noop() {
        let record = test_record();

        let patch = ActuatorPatch::at(Version::FIRST).with_host("10.0.0.2");
        let (addr, _) = patch.resolve(&record).unwrap();
        assert_eq!(addr, Address::new("10.0.0.2", 9000).unwrap());
        assert!(!patch.is_reflected_in(&record));

        let noop = ActuatorPatch::at(Version::FIRST).with_port(9000);
        assert!(noop.is_reflected_in(&record));

        let bad = ActuatorPatch::at(Version::FIRST).with_port(0);
        assert!(bad.resolve(&record).is_err());
    }
}
