//! # peerdrive-daemon
//!
//! Headless PeerDrive node.
//!
//! This binary:
//! - starts the libp2p swarm (unless `PEERDRIVE_NETWORK=false`)
//! - re-opens every registered drive and keeps it replicating
//! - logs every core event
//! - closes all drives cleanly on Ctrl+C

mod node_key;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerdrive_core::{CoreConfig, PeerDrive, ReplicationCoordinator};
use peerdrive_net::{SwarmCommand, SwarmConfig};
use peerdrive_shared::constants::APP_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,peerdrive_core=debug,peerdrive_net=info,peerdrive_store=info")
        }))
        .init();

    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = CoreConfig::from_env();
    info!(?config, "Loaded configuration");
    tokio::fs::create_dir_all(&config.data_dir).await?;

    // -----------------------------------------------------------------------
    // 3. Spawn the swarm and the replication coordinator
    // -----------------------------------------------------------------------
    let (coordinator, swarm_tx) = if config.network_enabled {
        let seed = node_key::load_or_create_seed(&config.data_dir).await?;
        let keypair = node_key::libp2p_keypair(seed)?;
        let swarm_config = SwarmConfig {
            bootstrap_peers_path: config.bootstrap_peers_path.clone(),
            listen_port: config.listen_port,
            extra_dials: Vec::new(),
        };

        let (cmd_tx, notif_rx, local_peer_id) = peerdrive_net::spawn_swarm(keypair, swarm_config).await?;
        info!(peer_id = %local_peer_id, port = config.listen_port, "Swarm started");

        let coordinator = ReplicationCoordinator::new(cmd_tx.clone(), config.discovery_timeout);
        coordinator.spawn_notification_loop(notif_rx);
        (coordinator, Some(cmd_tx))
    } else {
        info!("Network disabled, drives stay local");
        (ReplicationCoordinator::offline(), None)
    };

    let app = Arc::new(PeerDrive::new(config, coordinator));

    // -----------------------------------------------------------------------
    // 4. Log core events
    // -----------------------------------------------------------------------
    let mut events = app.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    info!(event = event.name(), %payload, "Core event");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Re-open registered drives
    // -----------------------------------------------------------------------
    let report = app.boot().await?;
    for drive in &report.opened {
        info!(
            drive = %drive.id(),
            name = %drive.record.name,
            key = %drive.record.public_key,
            writable = drive.is_writable(),
            "Drive online"
        );
    }

    // -----------------------------------------------------------------------
    // 6. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    let failures = app.shutdown().await;
    if !failures.is_empty() {
        warn!(count = failures.len(), "Some drives did not close cleanly");
    }
    if let Some(cmd_tx) = swarm_tx {
        let _ = cmd_tx.send(SwarmCommand::Shutdown).await;
    }

    Ok(())
}
