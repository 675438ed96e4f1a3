//! Clock abstraction
//!
//! Lease expiry in the memory store, grace periods and tombstone retention
//! are all measured on a `TimeProvider`. Production uses the wall clock;
//! tests freeze time and advance it by hand so expiry happens exactly when
//! the test says.
//!
//! Task scheduling (sweep ticks, retry backoff) stays on tokio timers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" for every liveness decision
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;

    /// Milliseconds since `since_ms`; zero if `since_ms` is in the future
    fn elapsed_ms(&self, since_ms: u64) -> u64 {
        self.now_ms().saturating_sub(since_ms)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WallClockTime;

impl WallClockTime {
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for WallClockTime {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(initial_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(initial_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to `ms`; earlier values are ignored
    pub fn set(&self, ms: u64) {
        self.now_ms.fetch_max(ms, Ordering::SeqCst);
    }
}

impl TimeProvider for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_is_epoch_based() {
        // 2020-01-01
        assert!(WallClockTime::new().now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock_only_moves_forward() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);

        clock.set(100);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(2_000);
        assert_eq!(clock.now_ms(), 2_000);
    }

    #[test]
    fn test_elapsed_saturates() {
        let clock = ManualClock::new(10_000);
        assert_eq!(clock.elapsed_ms(4_000), 6_000);
        assert_eq!(clock.elapsed_ms(12_000), 0);
    }
}
