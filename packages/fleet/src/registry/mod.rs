// packages/fleet/src/registry/mod.rs
//! Templates and agent state
//!
//! - **Template**: immutable blueprints agents are instantiated from
//! - **Agent**: the agent record, status machine vocabulary and health types
//! - **Store**: in-memory table of agents with bounded histories

pub mod agent;
pub mod store;
pub mod template;

pub use agent::{
    Agent, AgentCapabilities, AgentConfig, AgentEnvironment, AgentErrorRecord, AgentHealth,
    AgentId, AgentMetrics, AgentStatus, ErrorKind, HealthComponents, HealthIssue, HealthTrend,
    IssueKind, Severity, Workload,
};
pub use store::{AgentEntry, AgentRegistry, TaskSample};
pub use template::{
    AgentOverrides, AgentTemplate, ConfigOverrides, EnvironmentDefaults, StartupSpec,
    TemplateRegistry,
};
