// packages/fleet/src/registry/agent.rs
//! Agent records and their lifecycle vocabulary

use crate::runtime::process_manager::ProcessType;
use crate::runtime::resource_limiter::ResourceLimits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

/// Maximum entries kept in an agent's error history
pub const MAX_ERROR_HISTORY: usize = 50;

pub type AgentId = String;

/// Lifecycle status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Initializing,
    Idle,
    Busy,
    Error,
    Offline,
    Terminated,
}

impl AgentStatus {
    /// States from which `start_agent` may be called
    pub fn can_start(&self) -> bool {
        matches!(self, AgentStatus::Initializing | AgentStatus::Terminated)
    }

    /// Running and answering heartbeats
    pub fn is_running(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Terminated)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Initializing => "INITIALIZING",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Error => "ERROR",
            AgentStatus::Offline => "OFFLINE",
            AgentStatus::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// What an agent can do, copied from its template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCapabilities {
    pub skills: Vec<String>,
    pub task_types: Vec<String>,

    /// Resource ceilings; become the agent's limits unless overridden
    pub limits: ResourceLimits,

    /// Baseline quality, speed and reliability ratings (0-1)
    pub quality: f64,
    pub speed: f64,
    pub reliability: f64,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            skills: vec![],
            task_types: vec![],
            limits: ResourceLimits::default(),
            quality: 0.8,
            speed: 0.8,
            reliability: 0.8,
        }
    }
}

impl AgentCapabilities {
    /// True if `capability` names one of the skills or task types
    pub fn supports(&self, capability: &str) -> bool {
        self.skills.iter().any(|s| s == capability) || self.task_types.iter().any(|t| t == capability)
    }
}

/// Per-agent behavioural configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub autonomy_level: f64,
    pub max_concurrent_tasks: u32,
    pub task_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,

    /// Opt-out of health/heartbeat triggered restarts
    pub auto_restart: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            autonomy_level: 0.7,
            max_concurrent_tasks: 5,
            task_timeout_ms: 300_000,
            heartbeat_interval_ms: 10_000,
            auto_restart: true,
        }
    }
}

/// Execution environment of an agent process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnvironment {
    pub limits: ResourceLimits,
    pub permissions: Vec<String>,
    pub runtime: ProcessType,
    pub working_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub log_dir: PathBuf,

    /// Extra variables exported to the process
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub current_tasks: u32,
    pub max_tasks: u32,
    pub utilization_rate: f64,
}

impl Workload {
    pub fn new(max_tasks: u32) -> Self {
        Self {
            current_tasks: 0,
            max_tasks,
            utilization_rate: 0.0,
        }
    }

    pub fn assign(&mut self) {
        self.current_tasks += 1;
        self.refresh();
    }

    pub fn release(&mut self) {
        self.current_tasks = self.current_tasks.saturating_sub(1);
        self.refresh();
    }

    pub fn reset(&mut self) {
        self.current_tasks = 0;
        self.refresh();
    }

    fn refresh(&mut self) {
        self.utilization_rate = if self.max_tasks == 0 {
            0.0
        } else {
            self.current_tasks as f64 / self.max_tasks as f64
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_execution_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub restart_count: u32,
}

impl AgentMetrics {
    /// Fold one finished task into the running totals
    pub fn record_task(&mut self, success: bool, execution_time_ms: f64) {
        let previous = self.tasks_completed + self.tasks_failed;
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let total = previous + 1;

        self.average_execution_time_ms =
            (self.average_execution_time_ms * previous as f64 + execution_time_ms) / total as f64;
        self.success_rate = self.tasks_completed as f64 / total as f64;
        self.error_rate = self.tasks_failed as f64 / total as f64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Category of a recorded agent failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InitializationError,
    ExecutionError,
    CommunicationError,
    ResourceError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    pub context: serde_json::Value,
}

impl AgentErrorRecord {
    pub fn new(
        agent_id: &str,
        kind: ErrorKind,
        severity: Severity,
        message: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            context,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Communication,
    Performance,
    Reliability,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
    pub recommended_action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTrend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthComponents {
    pub responsiveness: f64,
    pub performance: f64,
    pub reliability: f64,
    pub resource_usage: f64,
}

impl HealthComponents {
    pub fn perfect() -> Self {
        Self {
            responsiveness: 1.0,
            performance: 1.0,
            reliability: 1.0,
            resource_usage: 1.0,
        }
    }

    /// Arithmetic mean of the four components
    pub fn overall(&self) -> f64 {
        (self.responsiveness + self.performance + self.reliability + self.resource_usage) / 4.0
    }
}

/// Composite health of an agent, recomputed every health cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub overall: f64,
    pub components: HealthComponents,
    pub issues: Vec<HealthIssue>,
    pub trend: HealthTrend,
    pub last_check: DateTime<Utc>,
}

impl Default for AgentHealth {
    fn default() -> Self {
        let components = HealthComponents::perfect();
        Self {
            overall: components.overall(),
            components,
            issues: vec![],
            trend: HealthTrend::Stable,
            last_check: Utc::now(),
        }
    }
}

/// The central fleet entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub agent_type: String,
    pub template: String,
    pub status: AgentStatus,
    pub capabilities: AgentCapabilities,
    pub workload: Workload,
    pub metrics: AgentMetrics,
    pub health: AgentHealth,
    pub environment: AgentEnvironment,
    pub config: AgentConfig,
    pub last_heartbeat: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub error_history: VecDeque<AgentErrorRecord>,
}

impl Agent {
    /// Append to the bounded error history, dropping the oldest entry
    pub fn record_error(&mut self, record: AgentErrorRecord) {
        if self.error_history.len() >= MAX_ERROR_HISTORY {
            self.error_history.pop_front();
        }
        self.error_history.push_back(record);
    }

    pub fn has_error(&self, kind: ErrorKind) -> bool {
        self.error_history.iter().any(|e| e.kind == kind)
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&AgentStatus::Initializing).unwrap();
        assert_eq!(json, "\"INITIALIZING\"");
        assert_eq!(AgentStatus::Busy.to_string(), "BUSY");
    }

    #[test]
    fn test_start_states() {
        assert!(AgentStatus::Initializing.can_start());
        assert!(AgentStatus::Terminated.can_start());
        assert!(!AgentStatus::Idle.can_start());
        assert!(!AgentStatus::Error.can_start());
    }

    #[test]
    fn test_workload_utilization() {
        let mut workload = Workload::new(4);
        workload.assign();
        workload.assign();
        assert_eq!(workload.utilization_rate, 0.5);
        workload.release();
        workload.release();
        workload.release();
        assert_eq!(workload.current_tasks, 0);
        assert_eq!(workload.utilization_rate, 0.0);
    }

    #[test]
    fn test_metrics_record_task() {
        let mut metrics = AgentMetrics::default();
        metrics.record_task(true, 100.0);
        metrics.record_task(false, 300.0);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.average_execution_time_ms, 200.0);
        assert_eq!(metrics.success_rate, 0.5);
        assert_eq!(metrics.error_rate, 0.5);
    }

    #[test]
    fn test_error_kind_names() {
        let json = serde_json::to_string(&ErrorKind::CommunicationError).unwrap();
        assert_eq!(json, "\"COMMUNICATION_ERROR\"");
    }

    #[test]
    fn test_default_health_is_perfect() {
        let health = AgentHealth::default();
        assert_eq!(health.overall, 1.0);
        assert!(health.issues.is_empty());
    }
}
