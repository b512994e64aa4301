// packages/fleet/src/main.rs
//! Agent Fleet Manager
//!
//! Runs the fleet manager as a daemon: loads templates, restores agents
//! from snapshots, runs the monitoring loops and stops every agent on
//! Ctrl+C / SIGTERM.

use agent_fleet::observability::{init_metrics, init_tracing};
use agent_fleet::{AgentManager, FleetConfig, FleetEvent};
use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = FleetConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability)?;
    if let Some(addr) = &config.observability.metrics_addr {
        init_metrics(addr)?;
        info!("Prometheus metrics on {}", addr);
    }

    info!("Starting Agent Fleet Manager v{}", agent_fleet::VERSION);
    debug!("Configuration loaded: {:?}", config);

    let manager = AgentManager::from_config(config.clone())?;

    if let Some(path) = &config.manager.templates_path {
        manager
            .load_templates(path)
            .with_context(|| format!("failed to load templates from {:?}", path))?;
    }

    match manager.restore_from_store() {
        Ok(count) if count > 0 => info!("Restored {} agents as TERMINATED", count),
        Ok(_) => {}
        Err(e) => warn!("Snapshot restore failed: {}", e),
    }

    manager.initialize().await?;

    let mut events = manager.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(FleetEvent::HealthAlert {
                    agent_id, overall, ..
                }) => {
                    debug!(%agent_id, overall, "Health alert");
                }
                Ok(event) => debug!(?event, "Fleet event"),
                Err(RecvError::Lagged(n)) => warn!("Event log lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let stats = manager.get_system_stats();
    info!(
        templates = stats.templates,
        agents = stats.total_agents,
        "Agent fleet ready"
    );

    shutdown_signal().await;
    info!("Received shutdown signal, stopping agents...");

    manager.shutdown().await;
    event_log.abort();

    info!("Agent fleet stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
