// packages/fleet/src/utils/errors.rs
//! Error types for the fleet manager

use thiserror::Error;

/// Errors returned by fleet operations
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template already registered: {0}")]
    TemplateExists(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Fleet capacity exceeded: {max} agents")]
    CapacityExceeded { max: usize },

    #[error("Size {target} outside allowed range [{min}, {max}]")]
    OutOfRange { target: usize, min: usize, max: usize },

    #[error("Cannot {operation} agent {agent_id} in state {from}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        operation: &'static str,
    },

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("Agent {agent_id} did not report ready within {timeout_ms}ms")]
    StartupTimeout { agent_id: String, timeout_ms: u64 },

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Cluster {cluster_id} is full ({max_size} members)")]
    ClusterFull { cluster_id: String, max_size: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<rusqlite::Error> for FleetError {
    fn from(err: rusqlite::Error) -> Self {
        FleetError::StorageFailed(err.to_string())
    }
}

/// Result type alias using `FleetError`
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = FleetError::OutOfRange {
            target: 10,
            min: 2,
            max: 5,
        };
        assert_eq!(err.to_string(), "Size 10 outside allowed range [2, 5]");
    }

    #[test]
    fn test_sqlite_error_maps_to_storage() {
        let err: FleetError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, FleetError::StorageFailed(_)));
    }
}
