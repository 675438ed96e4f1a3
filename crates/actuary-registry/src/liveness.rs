//! Liveness Tracker
//!
//! Reconciles local actuator status with coordination store lease state.
//! This is the only path by which a record becomes Unhealthy or Removed
//! without an explicit API call.
//!
//! ```text
//!   lease expires ──> Delete event ──> Healthy/Registering -> Unhealthy
//!                                          │ grace elapsed (sweep)
//!                                          ▼
//!                                       Removed ──> retention elapsed ──> evicted
//!
//!   watch lost ──> degraded ──> backoff ──> watch + list ──> atomic replace
//! ```
//!
//! Watch events carry store revisions; an event whose revision is not newer
//! than the local record is dropped, so the registry's own writes echoing
//! back through the watch are no-ops.

use crate::actuator::{ActuatorRecord, ActuatorStatus};
use crate::coordination::{CoordinationStore, Expect, KeySpace, Revision, WatchEvent, WatchStream};
use crate::error::{RegistryError, RegistryResult};
use crate::events::{EventPublisher, MembershipEvent};
use crate::locks::KeyedLocks;
use crate::record_store::{NodeRecordStore, Transition};
use actuary_core::{ActuaryConfig, ResyncConfig, TimeProvider};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Unhealthy records whose grace period ran out
    pub removed: usize,
    /// Removed records evicted after retention
    pub compacted: usize,
}

/// Applies watch events, expires grace periods, and resynchronizes
pub struct LivenessTracker {
    store: Arc<dyn CoordinationStore>,
    records: Arc<NodeRecordStore>,
    locks: Arc<KeyedLocks>,
    keys: KeySpace,
    grace_period_ms: u64,
    removed_retention_ms: u64,
    time: Arc<dyn TimeProvider>,
    events: EventPublisher,
}

impl LivenessTracker {
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
            grace_period_ms: config.lease.grace_period_ms,
            removed_retention_ms: config.registry.removed_retention_ms,
            time,
            events,
        }
    }

    fn commit(&self, transition: Option<Transition>) -> bool {
        match transition {
            Some(t) => {
                self.events.publish_transition(&t);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Watch Events
    // =========================================================================

    /// Fold one watch event into the Node Record Store
    ///
    /// Returns true if the local view changed.
    pub fn apply_event(&self, event: WatchEvent) -> bool {
        let Some(name) = self.keys.name_of(event.key()) else {
            debug!(key = event.key(), "Ignoring foreign key");
            return false;
        };

        match event {
            WatchEvent::Put(kv) => {
                let record = match ActuatorRecord::decode(&kv.value, kv.mod_revision) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(key = %kv.key, error = %e, "Skipping undecodable record");
                        return false;
                    }
                };
                if record.name != name {
                    warn!(key = %kv.key, name = %record.name, "Record name does not match key");
                    return false;
                }
                self.commit(self.records.apply(record))
            }
            WatchEvent::Delete { revision, .. } => {
                let live = self.records.get(&name).is_some_and(|r| r.status.is_live());
                if !live {
                    return false;
                }
                info!(name = %name, revision, "Lease lost, actuator unhealthy");
                self.commit(self.records.set_status(
                    &name,
                    ActuatorStatus::Unhealthy,
                    Some(revision),
                    self.time.now_ms(),
                ))
            }
        }
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Expire grace periods and compact old tombstones
    ///
    /// Names currently held by an API mutation are skipped until the next
    /// pass.
    pub async fn sweep(&self) -> SweepStats {
        let now_ms = self.time.now_ms();
        let snapshot = self.records.snapshot();
        let mut stats = SweepStats::default();

        for record in snapshot.all() {
            match record.status {
                ActuatorStatus::Unhealthy => {
                    let since = record.unhealthy_since_ms.unwrap_or(record.updated_at_ms);
                    if self.time.elapsed_ms(since) < self.grace_period_ms {
                        continue;
                    }
                    let Some(_guard) = self.locks.try_lock(&record.name) else {
                        continue;
                    };
                    // Renewed between snapshot and lock
                    let current = self.records.get(&record.name);
                    if current.map(|r| r.revision) != Some(record.revision) {
                        continue;
                    }
                    let removed = self.records.set_status(
                        &record.name,
                        ActuatorStatus::Removed,
                        None,
                        now_ms,
                    );
                    if self.commit(removed) {
                        info!(name = %record.name, "Grace period elapsed, actuator removed");
                        stats.removed += 1;
                    }
                }
                ActuatorStatus::Removed => {
                    let since = record.removed_at_ms.unwrap_or(record.updated_at_ms);
                    if self.time.elapsed_ms(since) < self.removed_retention_ms {
                        continue;
                    }
                    let Some(_guard) = self.locks.try_lock(&record.name) else {
                        continue;
                    };
                    if self.compact(record).await {
                        stats.compacted += 1;
                    }
                }
                ActuatorStatus::Registering | ActuatorStatus::Healthy => {}
            }
        }

        if stats != SweepStats::default() {
            debug!(removed = stats.removed, compacted = stats.compacted, "Sweep finished");
        }
        stats
    }

    async fn compact(&self, record: &ActuatorRecord) -> bool {
        let key = self.keys.key(&record.name);
        match self
            .store
            .delete(&key, Expect::Revision(record.revision))
            .await
        {
            // Key already gone or rewritten since
            Ok(_) | Err(RegistryError::PreconditionFailed { .. }) => {}
            Err(e) => {
                warn!(key, error = %e, "Tombstone delete failed, retrying next sweep");
                return false;
            }
        }
        self.records.evict(&record.name, record.revision)
    }

    // =========================================================================
    // Resync
    // =========================================================================

    /// Rebuild the Node Record Store from a full listing
    ///
    /// The swap is atomic. Local records written after the listing was taken
    /// are kept. Live local records absent from the listing lost their lease
    /// while nobody was watching and become Unhealthy. Returns the listing
    /// revision.
    #[instrument(skip_all)]
    pub async fn resync(&self) -> RegistryResult<Revision> {
        let listing = self.store.list(self.keys.prefix()).await?;
        let now_ms = self.time.now_ms();

        let mut listed = BTreeMap::new();
        for kv in &listing.kvs {
            let Some(name) = self.keys.name_of(&kv.key) else {
                continue;
            };
            match ActuatorRecord::decode(&kv.value, kv.mod_revision) {
                Ok(record) if record.name == name => {
                    listed.insert(name, record);
                }
                Ok(record) => {
                    warn!(key = %kv.key, name = %record.name, "Record name does not match key");
                }
                Err(e) => warn!(key = %kv.key, error = %e, "Skipping undecodable record"),
            }
        }

        let snapshot = self.records.replace_with(|current| {
            let mut next = listed;
            for local in current.all() {
                let newer = local.revision > listing.revision;
                match next.get(&local.name) {
                    Some(_) if !newer => {}
                    Some(_) => {
                        next.insert(local.name.clone(), (**local).clone());
                    }
                    None if newer || !local.status.is_live() => {
                        next.insert(local.name.clone(), (**local).clone());
                    }
                    None => {
                        let mut lost = local.with_status(ActuatorStatus::Unhealthy, now_ms);
                        lost.revision = listing.revision;
                        next.insert(local.name.clone(), lost);
                    }
                }
            }
            next.into_values().collect()
        });

        info!(
            records = snapshot.len(),
            revision = listing.revision,
            "Record store resynchronized"
        );
        self.events.publish(MembershipEvent::Resynced {
            records: snapshot.len(),
        });
        Ok(listing.revision)
    }

    /// Open a prefix watch and resync behind it
    ///
    /// The watch is opened first so nothing written between the listing and
    /// the subscription is missed. Events at or below the returned revision
    /// are already reflected. Clears the degraded flag.
    pub async fn subscribe(&self) -> RegistryResult<(WatchStream, Revision)> {
        let stream = self.store.watch(self.keys.prefix()).await?;
        let revision = self.resync().await?;
        if self.records.set_degraded(false) {
            info!(revision, "Watch re-established");
        }
        Ok((stream, revision))
    }

    /// Flag the local view as possibly stale
    pub fn mark_degraded(&self) {
        if !self.records.set_degraded(true) {
            warn!("Watch lost, serving last known snapshot as stale");
        }
    }
}

impl std::fmt::Debug for LivenessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessTracker")
            .field("keys", &self.keys)
            .field("grace_period_ms", &self.grace_period_ms)
            .field("removed_retention_ms", &self.removed_retention_ms)
            .finish()
    }
}

// =============================================================================
// Background Task
// =============================================================================

/// Background task consuming the watch stream and running sweeps
///
/// Runs until `stop()` is called or the handle is dropped.
pub struct LivenessTask {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl LivenessTask {
    /// Start the task
    pub fn start(
        tracker: Arc<LivenessTracker>,
        sweep_interval: Duration,
        resync: &ResyncConfig,
    ) -> Self {
        assert!(!sweep_interval.is_zero());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(resync.backoff_initial_ms),
            current_interval: Duration::from_millis(resync.backoff_initial_ms),
            max_interval: Duration::from_millis(resync.backoff_max_ms),
            max_elapsed_time: None,
            ..Default::default()
        };

        let handle = tokio::spawn(run(tracker, sweep_interval, backoff, shutdown_rx));
        Self {
            handle: Some(handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Signal the task to stop
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }

    /// Stop the task and wait for it to exit
    pub async fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Liveness task panicked");
            }
        }
    }
}

impl Drop for LivenessTask {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    tracker: Arc<LivenessTracker>,
    sweep_interval: Duration,
    mut backoff: ExponentialBackoff,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match tracker.subscribe().await {
            Ok((mut stream, from)) => {
                backoff.reset();
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            info!("Liveness task shutting down");
                            return;
                        }
                        event = stream.next() => match event {
                            Some(event) if event.revision() > from => {
                                tracker.apply_event(event);
                            }
                            Some(_) => {}
                            None => {
                                tracker.mark_degraded();
                                break;
                            }
                        },
                        _ = sweep.tick() => {
                            tracker.sweep().await;
                        }
                    }
                }
            }
            Err(e) => {
                tracker.mark_degraded();
                warn!(error = %e, "Watch subscribe failed");
            }
        }

        let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
        debug!(delay_ms = delay.as_millis() as u64, "Resubscribing after backoff");
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("Liveness task shutting down");
}
