//! Record versions for optimistic concurrency
//!
//! A caller changing an actuator presents the version it last read. The
//! change is accepted only against that exact version; anything else is a
//! mismatch and the caller must re-read.
//!
//! Versions count caller mutations only (create, change, delete). Liveness
//! transitions leave them alone.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-record mutation counter; 1 after create
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

/// Presented version differs from the record's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMismatch {
    pub presented: Version,
    pub current: Version,
}

impl VersionMismatch {
    /// Presented version was superseded (a replayed or lost-race write)
    pub fn is_stale(&self) -> bool {
        self.presented < self.current
    }
}

impl Version {
    /// Version assigned by a successful create
    pub const FIRST: Self = Version(1);

    pub const fn new(v: u64) -> Self {
        Version(v)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Version after one more accepted mutation
    pub fn next(&self) -> Self {
        assert!(self.0 < u64::MAX, "version overflow");
        Version(self.0 + 1)
    }

    /// Accept `presented` only if it is exactly this version
    pub fn check(&self, presented: Version) -> Result<(), VersionMismatch> {
        if presented == *self {
            Ok(())
        } else {
            Err(VersionMismatch {
                presented,
                current: *self,
            })
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_is_monotonic() {
        let v2 = Version::FIRST.next();
        assert_eq!(v2.value(), 2);
        assert!(Version::FIRST < v2);
    }

    #[test]
    fn test_check_exact_match_only() {
        let current = Version::new(3);
        assert!(current.check(Version::new(3)).is_ok());

        let replay = current.check(Version::new(2)).unwrap_err();
        assert!(replay.is_stale());
        assert_eq!(replay.current, current);

        let ahead = current.check(Version::new(4)).unwrap_err();
        assert!(!ahead.is_stale());
    }

    #[test]
    fn test_serializes_as_bare_integer() {
        let json = serde_yaml::to_string(&Version::new(7)).unwrap();
        assert_eq!(json.trim(), "7");
    }
}
