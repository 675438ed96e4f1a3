//! Per-name critical sections
//!
//! Mutations on one actuator never wait on mutations of another. Each name
//! gets its own async mutex, created on first use and dropped again once no
//! task holds or waits for it.

use crate::actuator::ActuatorName;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of async mutexes keyed by actuator name
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<ActuatorName, Arc<Mutex<()>>>,
}

/// Exclusive hold on one name
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    name: ActuatorName,
    slot: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &ActuatorName) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `name`
    pub async fn lock(&self, name: &ActuatorName) -> KeyGuard<'_> {
        let slot = self.slot(name);
        let guard = slot.clone().lock_owned().await;
        KeyGuard {
            locks: self,
            name: name.clone(),
            slot,
            guard: Some(guard),
        }
    }

    /// Take `name` only if nobody holds it
    pub fn try_lock(&self, name: &ActuatorName) -> Option<KeyGuard<'_>> {
        let slot = self.slot(name);
        match slot.clone().try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                locks: self,
                name: name.clone(),
                slot,
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(name, &slot);
                None
            }
        }
    }

    /// Number of names with an allocated lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn release(&self, name: &ActuatorName, slot: &Arc<Mutex<()>>) {
        // One reference in the map plus the caller's
        self.locks
            .remove_if(name, |_, v| Arc::ptr_eq(v, slot) && Arc::strong_count(v) == 2);
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.name, &self.slot);
    }
}
