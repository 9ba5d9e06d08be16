//! Standalone mode: every subsystem in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use nodeshift_core::{NodeshiftConfig, TokioClock};
use nodeshift_rollout::{LoggingRouter, Orchestrator, SimulatedProvisioner, UpgradeError};
use nodeshift_state::{NodePool, StateStore};

pub async fn run(config: NodeshiftConfig, port: u16, data_dir: PathBuf) -> anyhow::Result<()> {
    info!(cluster = %config.cluster_name(), "nodeshift daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("nodeshift.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let settings = config.orchestrator_settings()?;
    let provisioner = Arc::new(SimulatedProvisioner::default());
    for pool in store.list_pools()? {
        for node in store.list_nodes_for_pool(&pool.id)? {
            provisioner.adopt(&node);
        }
    }

    let orchestrator = Orchestrator::new(
        store,
        provisioner,
        Arc::new(LoggingRouter::new()),
        Arc::new(TokioClock),
        settings,
    );

    let recovered = orchestrator.recover().await?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "archived upgrades interrupted by the last shutdown");
    }

    seed_pools(&orchestrator, &config).await?;

    // ── Start API server ───────────────────────────────────────

    let router = nodeshift_api::build_router(orchestrator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    orchestrator.shutdown().await;
    info!("nodeshift daemon stopped");
    Ok(())
}

/// Register the `[[pools]]` entries that the store does not know yet.
async fn seed_pools(orchestrator: &Orchestrator, config: &NodeshiftConfig) -> anyhow::Result<()> {
    for cfg in &config.pools {
        let pool = NodePool::try_from(cfg)?;
        match orchestrator.get_pool(&pool.id) {
            Ok(_) => {
                debug!(pool = %pool.id, "configured pool already registered");
                continue;
            }
            Err(UpgradeError::PoolNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        orchestrator
            .register_pool(pool)
            .await
            .with_context(|| format!("registering configured pool {}", cfg.id))?;
    }
    Ok(())
}
