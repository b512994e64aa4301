// packages/fleet/src/observability.rs
//! Logging and metrics setup
//!
//! Logs go through `tracing`; `RUST_LOG` wins over the configured level.
//! Metrics are recorded with the `metrics` facade and exposed by the
//! Prometheus exporter when an address is configured.

use crate::utils::config::ObservabilityConfig;
use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

/// Start the Prometheus exporter on `addr` and describe the fleet metrics.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics address '{}'", addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_gauge!("fleet_agents", Unit::Count, "Agents currently registered");
    describe_counter!("fleet_agents_created_total", Unit::Count, "Agents created from templates");
    describe_counter!(
        "fleet_agent_starts_total",
        Unit::Count,
        "Agent start attempts by outcome"
    );
    describe_counter!("fleet_agent_restarts_total", Unit::Count, "Agent restarts by reason");
    describe_counter!(
        "fleet_status_transitions_total",
        Unit::Count,
        "Agent status transitions by target status"
    );
    describe_counter!(
        "fleet_heartbeat_timeouts_total",
        Unit::Count,
        "Agents that missed their heartbeat deadline"
    );
    describe_histogram!("fleet_agent_health", "Overall health scores from health checks");
    describe_gauge!("fleet_pool_size", Unit::Count, "Members per pool");
}
