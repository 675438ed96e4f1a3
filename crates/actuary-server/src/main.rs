//! Actuary Server
//!
//! Standalone executor registry binary. Hosts the registry engine against
//! the configured coordination store until interrupted.

use actuary_core::{
    init_telemetry, ActuaryConfig, StoreBackend, TelemetryConfig, TimeProvider, WallClockTime,
};
use actuary_registry::{
    ActuatorRegistry, CoordinationStore, MembershipEvent, MemoryCoordinationStore,
};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Actuary server CLI
#[derive(Parser, Debug)]
#[command(name = "actuary-server")]
#[command(about = "Executor membership and liveness registry")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig::from_env();
    match cli.verbose {
        0 => {}
        1 => telemetry = telemetry.with_log_level("debug"),
        _ => telemetry = telemetry.with_log_level("trace"),
    }
    let _telemetry = init_telemetry(telemetry).context("telemetry init failed")?;

    let config = match &cli.config {
        Some(path) => ActuaryConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => ActuaryConfig::default(),
    };
    tracing::info!(
        config = cli.config.as_deref().unwrap_or("<defaults>"),
        backend = ?config.store.backend,
        lease_ttl_ms = config.lease.ttl_ms,
        grace_period_ms = config.lease.grace_period_ms,
        "Actuary server starting"
    );

    let time: Arc<dyn TimeProvider> = Arc::new(WallClockTime::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (store, reaper) = connect_store(&config, time.clone(), shutdown_rx.clone()).await?;
    let registry = ActuatorRegistry::start(config, store, time)
        .await
        .context("registry failed to start")?;
    let events = tokio::spawn(log_events(registry.subscribe(), shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    registry.shutdown().await;
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    let _ = events.await;

    tracing::info!("Actuary server stopped");
    Ok(())
}

/// Build the configured coordination store
///
/// The memory backend has no server-side lease clock, so a reaper task
/// expires its leases on the sweep cadence.
async fn connect_store(
    config: &ActuaryConfig,
    time: Arc<dyn TimeProvider>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<(Arc<dyn CoordinationStore>, Option<JoinHandle<()>>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory coordination store; membership is not shared");
            let store = Arc::new(MemoryCoordinationStore::new(time));
            let interval = Duration::from_millis(config.registry.sweep_interval_ms);
            let reaper = tokio::spawn(reap_leases(store.clone(), interval, shutdown_rx));
            Ok((store, Some(reaper)))
        }
        StoreBackend::Etcd => connect_etcd(config).await.map(|store| (store, None)),
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &ActuaryConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    let store =
        actuary_registry::EtcdCoordinationStore::connect(&config.store.endpoints, &config.retry)
            .await
            .context("failed to connect to etcd")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &ActuaryConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    anyhow::bail!("store.backend is etcd but actuary-server was built without the `etcd` feature")
}

async fn reap_leases(
    store: Arc<MemoryCoordinationStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                let expired = store.expire_leases().await;
                if expired > 0 {
                    tracing::debug!(expired, "Expired leases");
                }
            }
        }
    }
}

async fn log_events(
    mut events: broadcast::Receiver<MembershipEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = events.recv() => match event {
                Ok(event) => tracing::info!(?event, "Membership event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Membership event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
