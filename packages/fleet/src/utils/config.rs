// packages/fleet/src/utils/config.rs
//! Fleet configuration
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. Optional file: `$FLEET_CONFIG`, or `config/fleet.{yaml,toml,json}`
//! 3. Environment overrides: `FLEET__SECTION__KEY` (e.g. `FLEET__MANAGER__MAX_AGENTS=200`)

use crate::utils::errors::{FleetError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Snapshots are for crash recovery; ten years is already generous
const MAX_SNAPSHOT_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Top-level fleet configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub manager: ManagerConfig,
    pub lifecycle: LifecycleConfig,
    pub health: HealthConfig,
    pub heartbeat: HeartbeatConfig,
    pub scaling: ScalingConfig,
    pub persistence: PersistenceConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of agents the registry may hold
    pub max_agents: usize,

    /// Root for per-agent work/tmp/log directories
    pub data_dir: PathBuf,

    /// Time-to-live of persisted agent snapshots
    pub snapshot_ttl_secs: u64,

    /// Optional YAML file of templates loaded at startup
    pub templates_path: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_agents: 100,
            data_dir: std::env::temp_dir().join("agent-fleet"),
            snapshot_ttl_secs: 24 * 60 * 60,
            templates_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long `start_agent` waits for the `agent-ready` signal
    pub startup_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    pub shutdown_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 30_000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl LifecycleConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health sweeps
    pub check_interval_ms: u64,

    /// Global switch for automatic restarts (agents can also opt out)
    pub auto_restart: bool,

    /// Baseline task execution time used by the performance score
    pub expected_execution_ms: u64,

    /// Overall score below which an agent is restarted
    pub critical_threshold: f64,

    /// Automatic restarts allowed per agent inside `restart_window_secs`
    pub max_restarts: u32,

    pub restart_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            auto_restart: true,
            expected_execution_ms: 5_000,
            critical_threshold: 0.3,
            max_restarts: 3,
            restart_window_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat sweeps
    pub check_interval_ms: u64,

    /// Missed-interval multiple that counts as a timeout
    pub timeout_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            timeout_multiplier: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Autoscale control loop interval; `None` leaves scaling to callers
    pub autoscale_interval_ms: Option<u64>,

    /// Cooldown for policies derived from pool thresholds
    pub default_cooldown_secs: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            autoscale_interval_ms: None,
            default_cooldown_secs: 60,
        }
    }
}

/// Snapshot store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,

    /// SQLite database file (sqlite backend only)
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            path: PathBuf::from("fleet-snapshots.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub log_level: String,

    pub json_logs: bool,

    /// Prometheus exporter listen address; disabled when `None`
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info,agent_fleet=debug".to_string(),
            json_logs: false,
            metrics_addr: Some("0.0.0.0:9464".to_string()),
        }
    }
}

impl FleetConfig {
    /// Load configuration from file and environment on top of defaults
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        builder = match std::env::var("FLEET_CONFIG") {
            Ok(path) => builder.add_source(File::with_name(&path)),
            Err(_) => builder.add_source(File::with_name("config/fleet").required(false)),
        };

        let config: FleetConfig = builder
            .add_source(
                Environment::with_prefix("FLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall loops or make the fleet unusable
    pub fn validate(&self) -> Result<()> {
        if self.manager.max_agents == 0 {
            return Err(FleetError::InvalidConfig("manager.max_agents cannot be 0".into()));
        }
        if self.health.check_interval_ms == 0 {
            return Err(FleetError::InvalidConfig("health.check_interval_ms cannot be 0".into()));
        }
        if self.heartbeat.check_interval_ms == 0 {
            return Err(FleetError::InvalidConfig("heartbeat.check_interval_ms cannot be 0".into()));
        }
        if self.heartbeat.timeout_multiplier == 0 {
            return Err(FleetError::InvalidConfig("heartbeat.timeout_multiplier cannot be 0".into()));
        }
        if !(0.0..=1.0).contains(&self.health.critical_threshold) {
            return Err(FleetError::InvalidConfig(
                "health.critical_threshold must be within [0, 1]".into(),
            ));
        }
        if self.manager.snapshot_ttl_secs > MAX_SNAPSHOT_TTL_SECS {
            return Err(FleetError::InvalidConfig(format!(
                "manager.snapshot_ttl_secs cannot exceed {}",
                MAX_SNAPSHOT_TTL_SECS
            )));
        }
        if self.scaling.autoscale_interval_ms == Some(0) {
            return Err(FleetError::InvalidConfig("scaling.autoscale_interval_ms cannot be 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat.timeout_multiplier, 3);
        assert_eq!(config.health.critical_threshold, 0.3);
        assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let mut config = FleetConfig::default();
        config.manager.max_agents = 0;
        assert!(matches!(config.validate(), Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_bounds_snapshot_ttl() {
        let mut config = FleetConfig::default();
        config.manager.snapshot_ttl_secs = 10_000_000_000_000;
        assert!(matches!(config.validate(), Err(FleetError::InvalidConfig(_))));

        config.manager.snapshot_ttl_secs = MAX_SNAPSHOT_TTL_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "manager:\n  max_agents: 7\nhealth:\n  auto_restart: false\n";
        let config: FleetConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.manager.max_agents, 7);
        assert!(!config.health.auto_restart);
        assert_eq!(config.lifecycle.startup_timeout_ms, 30_000);
    }
}
