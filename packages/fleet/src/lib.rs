// packages/fleet/src/lib.rs
//! Agent Fleet Manager Library
//!
//! Creates agents from templates, runs each one as a child process, keeps
//! track of their status and health, and groups them into pools and
//! clusters that can be scaled.
//!
//! # Architecture
//!
//! - **registry**: templates, agent records and the in-memory agent table
//! - **runtime**: process spawning, stdout signal pump, resource limits
//! - **monitoring**: health scoring, heartbeat timeouts, restart budget
//! - **scaling**: pools, clusters and scaling policies
//! - **persistence**: TTL'd agent snapshots for crash recovery
//! - **events**: inbound agent signals and outbound fleet events
//! - **manager**: the `AgentManager` tying everything together
//! - **observability**: tracing and Prometheus setup
//! - **utils**: configuration and errors

pub mod events;
pub mod manager;
pub mod monitoring;
pub mod observability;
pub mod persistence;
pub mod registry;
pub mod runtime;
pub mod scaling;
pub mod utils;

// Re-export commonly used types
pub use events::{AgentSignal, FleetEvent};
pub use manager::{AgentManager, SystemStats};
pub use registry::{Agent, AgentOverrides, AgentStatus, AgentTemplate};
pub use scaling::{AssignmentStrategy, PoolOptions, ScalingPolicy};
pub use utils::config::FleetConfig;
pub use utils::errors::{FleetError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
