// packages/fleet/src/monitoring/heartbeat.rs
//! Heartbeat timeout detection
//!
//! Only IDLE and BUSY agents are expected to heartbeat. INITIALIZING agents
//! are still inside their startup timeout; ERROR and OFFLINE agents are
//! already being handled.

use crate::registry::agent::{Agent, AgentId};
use crate::registry::store::AgentRegistry;
use crate::utils::config::HeartbeatConfig;
use chrono::{DateTime, Utc};

/// An agent that missed its heartbeat deadline
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatTimeout {
    pub agent_id: AgentId,
    pub last_heartbeat: DateTime<Utc>,
    pub silent_for_ms: i64,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    timeout_multiplier: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            timeout_multiplier: config.timeout_multiplier,
        }
    }

    /// Silence after which `agent` counts as unresponsive
    pub fn deadline_ms(&self, agent: &Agent) -> i64 {
        (agent.config.heartbeat_interval_ms as i64).saturating_mul(self.timeout_multiplier as i64)
    }

    pub fn check(&self, agent: &Agent, now: DateTime<Utc>) -> Option<HeartbeatTimeout> {
        if !agent.status.is_running() {
            return None;
        }

        let silent_for_ms = (now - agent.last_heartbeat).num_milliseconds();
        (silent_for_ms > self.deadline_ms(agent)).then(|| HeartbeatTimeout {
            agent_id: agent.id.clone(),
            last_heartbeat: agent.last_heartbeat,
            silent_for_ms,
        })
    }

    /// Every running agent whose heartbeat is overdue
    pub fn scan(&self, registry: &AgentRegistry, now: DateTime<Utc>) -> Vec<HeartbeatTimeout> {
        registry
            .filter(|a| a.status.is_running())
            .iter()
            .filter_map(|a| self.check(a, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::agent::AgentStatus;
    use crate::registry::template::{AgentOverrides, AgentTemplate};
    use std::path::Path;

    fn agent(id: &str, status: AgentStatus, silent_ms: i64) -> Agent {
        let mut template = AgentTemplate::new("t", "worker");
        template.config.heartbeat_interval_ms = 1_000;
        let mut agent =
            template.instantiate(id.to_string(), &AgentOverrides::default(), Path::new("/tmp"));
        agent.status = status;
        agent.last_heartbeat = Utc::now() - chrono::Duration::milliseconds(silent_ms);
        agent
    }

    #[test]
    fn test_deadline_is_multiple_of_interval() {
        let monitor = HeartbeatMonitor::new(&HeartbeatConfig::default());
        assert_eq!(monitor.deadline_ms(&agent("a", AgentStatus::Idle, 0)), 3_000);
    }

    #[test]
    fn test_timeout_detected() {
        let monitor = HeartbeatMonitor::new(&HeartbeatConfig::default());
        let now = Utc::now();
        assert!(monitor.check(&agent("a", AgentStatus::Idle, 2_000), now).is_none());

        let timeout = monitor.check(&agent("a", AgentStatus::Busy, 3_500), now).unwrap();
        assert_eq!(timeout.agent_id, "a");
        assert!(timeout.silent_for_ms >= 3_500);
    }

    #[test]
    fn test_non_running_agents_skipped() {
        let monitor = HeartbeatMonitor::new(&HeartbeatConfig::default());
        let now = Utc::now();
        for status in [
            AgentStatus::Initializing,
            AgentStatus::Error,
            AgentStatus::Offline,
            AgentStatus::Terminated,
        ] {
            assert!(monitor.check(&agent("a", status, 60_000), now).is_none());
        }
    }

    #[test]
    fn test_scan_registry() {
        let registry = AgentRegistry::new();
        registry.insert(agent("quiet", AgentStatus::Idle, 10_000), 10).unwrap();
        registry.insert(agent("fresh", AgentStatus::Idle, 0), 10).unwrap();
        registry.insert(agent("down", AgentStatus::Offline, 10_000), 10).unwrap();

        let monitor = HeartbeatMonitor::new(&HeartbeatConfig::default());
        let timeouts = monitor.scan(&registry, Utc::now());
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].agent_id, "quiet");
    }
}
