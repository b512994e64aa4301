// packages/fleet/src/events.rs
//! Fleet events
//!
//! Outbound `FleetEvent`s are published on a broadcast channel for
//! downstream consumers (schedulers, dashboards). Inbound `AgentSignal`s
//! are what running agents report, one JSON object per stdout line, or
//! injected by an external bus through `AgentManager::handle_signal`.

use crate::registry::agent::{AgentId, AgentStatus, HealthIssue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Signals emitted by running agent processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentSignal {
    AgentReady,
    Heartbeat,
    #[serde(rename_all = "camelCase")]
    AgentError {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskAssigned {
        task_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        task_id: String,
        success: bool,
        execution_time_ms: f64,
    },
    #[serde(rename_all = "camelCase")]
    ResourceUsage {
        memory_mb: f64,
        cpu_percent: f64,
        #[serde(default)]
        disk_mb: f64,
        #[serde(default)]
        network_mbps: f64,
    },
}

impl AgentSignal {
    /// Parse one stdout line; `None` for anything that is not a signal
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Events published by the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FleetEvent {
    Created {
        agent_id: AgentId,
        template: String,
    },
    Started {
        agent_id: AgentId,
        pid: Option<u32>,
    },
    Stopped {
        agent_id: AgentId,
        reason: String,
    },
    Restarted {
        agent_id: AgentId,
        reason: String,
    },
    Removed {
        agent_id: AgentId,
    },
    StatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    HeartbeatTimeout {
        agent_id: AgentId,
        last_heartbeat: DateTime<Utc>,
    },
    ProcessExit {
        agent_id: AgentId,
        code: Option<i32>,
    },
    ProcessError {
        agent_id: AgentId,
        message: String,
    },
    HealthAlert {
        agent_id: AgentId,
        overall: f64,
        issues: Vec<HealthIssue>,
    },
    PoolCreated {
        pool_id: String,
        name: String,
    },
    PoolScaled {
        pool_id: String,
        from: usize,
        to: usize,
    },
    ClusterCreated {
        cluster_id: String,
        coordinator: AgentId,
    },
}

/// Broadcast channel for `FleetEvent`s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    /// Capacity is how many events a slow subscriber may lag behind
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: FleetEvent) {
        trace!(?event, "Publishing fleet event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ready() {
        assert_eq!(
            AgentSignal::parse_line(r#"{"type":"agent-ready"}"#),
            Some(AgentSignal::AgentReady)
        );
    }

    #[test]
    fn test_parse_task_completed() {
        let signal = AgentSignal::parse_line(
            r#"{"type":"task-completed","taskId":"t1","success":false,"executionTimeMs":1500}"#,
        );
        assert_eq!(
            signal,
            Some(AgentSignal::TaskCompleted {
                task_id: "t1".to_string(),
                success: false,
                execution_time_ms: 1500.0,
            })
        );
    }

    #[test]
    fn test_parse_resource_usage_defaults() {
        let signal =
            AgentSignal::parse_line(r#"{"type":"resource-usage","memoryMb":100,"cpuPercent":5}"#);
        assert!(matches!(
            signal,
            Some(AgentSignal::ResourceUsage { disk_mb, .. }) if disk_mb == 0.0
        ));
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert_eq!(AgentSignal::parse_line("starting up..."), None);
        assert_eq!(AgentSignal::parse_line(r#"{"type":"unknown"}"#), None);
        assert_eq!(AgentSignal::parse_line(""), None);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(FleetEvent::Removed {
            agent_id: "a1".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            FleetEvent::Removed {
                agent_id: "a1".to_string()
            }
        );
    }
}
