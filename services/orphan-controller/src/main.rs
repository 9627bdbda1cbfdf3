//! keel orphan controller
//!
//! Runs on every storage node. Watches orphan, node and instance manager
//! resources and reconciles orphans this node is responsible for: claims
//! them, keeps their conditions current, and deletes their data once they
//! are removed and it is safe to do so.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keel_orphan_controller::config::Config;
use keel_orphan_controller::disk_service::GrpcDiskServiceConnector;
use keel_orphan_controller::store::{MemoryStore, Seed};
use keel_orphan_controller::OrphanController;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        controller_id = %config.controller.controller_id,
        namespace = %config.controller.namespace,
        workers = config.controller.workers,
        disk_service_port = config.disk_service_port,
        "Starting keel orphan controller"
    );

    let store = match &config.seed_file {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read seed file {path}"))?;
            let seed: Seed = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse seed file {path}"))?;
            info!(
                path = %path,
                orphans = seed.orphans.len(),
                nodes = seed.nodes.len(),
                instance_managers = seed.instance_managers.len(),
                "Seeding store"
            );
            MemoryStore::from_seed(seed).await?
        }
        None => MemoryStore::new(),
    };
    let store = Arc::new(store);

    let disk_service = Arc::new(GrpcDiskServiceConnector::new(
        config.disk_service_port,
        config.rpc_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = OrphanController::new(config.controller.clone(), store, disk_service);
    let mut controller_handle = tokio::spawn(async move { controller.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Orphan controller task panicked");
            }
            return Ok(());
        }
    }

    // Signal shutdown; in-flight reconciles finish, disk service calls are
    // bounded by the RPC timeout.
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = config.rpc_timeout + Duration::from_secs(5);
    match tokio::time::timeout(shutdown_timeout, controller_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Orphan controller task panicked"),
        Err(_) => error!("Orphan controller did not shut down in time"),
    }

    info!("Orphan controller shutdown complete");
    Ok(())
}
