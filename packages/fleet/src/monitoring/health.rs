// packages/fleet/src/monitoring/health.rs
//! Agent health scoring
//!
//! Every health cycle recomputes four component scores in [0, 1]:
//!
//! - **responsiveness**: heartbeat age against the agent's interval
//! - **performance**: expected execution time over the recent mean
//! - **reliability**: completed / (completed + failed)
//! - **resource usage**: headroom left under the agent's limits
//!
//! `overall` is their mean. Scoring is pure; applying the result (storing
//! it, alerting, restarting) is the manager's job.

use crate::registry::agent::{
    AgentHealth, AgentId, HealthComponents, HealthIssue, HealthTrend, IssueKind, Severity,
};
use crate::registry::store::AgentEntry;
use crate::runtime::resource_limiter::ResourceLimiter;
use crate::utils::config::HealthConfig;
use crate::utils::errors::{FleetError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Task samples averaged by the performance score
pub const PERFORMANCE_WINDOW: usize = 10;

/// Overall-score change treated as noise when computing the trend
const TREND_DEAD_BAND: f64 = 0.05;

/// Result of scoring one agent
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub agent_id: AgentId,
    pub health: AgentHealth,

    /// Overall score fell below the critical threshold
    pub critical: bool,
}

/// Scores agents against the health configuration
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    limiter: ResourceLimiter,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, limiter: ResourceLimiter) -> Self {
        Self { config, limiter }
    }

    /// Score one agent as of `now`
    pub fn evaluate(&self, entry: &AgentEntry, now: DateTime<Utc>) -> Result<HealthReport> {
        let agent = &entry.agent;

        let components = HealthComponents {
            responsiveness: responsiveness(
                now,
                agent.last_heartbeat,
                agent.config.heartbeat_interval_ms,
            ),
            performance: performance(
                entry.recent_execution_ms(PERFORMANCE_WINDOW),
                self.config.expected_execution_ms,
            ),
            reliability: reliability(agent.metrics.tasks_completed, agent.metrics.tasks_failed),
            resource_usage: self
                .limiter
                .headroom_score(&agent.environment.limits, entry.latest_usage()),
        };

        let values = [
            components.responsiveness,
            components.performance,
            components.reliability,
            components.resource_usage,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FleetError::RuntimeError(format!(
                "non-finite health component for {}: {:?}",
                agent.id, components
            )));
        }

        let overall = components.overall();
        let health = AgentHealth {
            overall,
            components,
            issues: issues(&components),
            trend: trend(agent.health.overall, overall),
            last_check: now,
        };

        Ok(HealthReport {
            agent_id: agent.id.clone(),
            critical: overall < self.config.critical_threshold,
            health,
        })
    }
}

/// 1.0 within two intervals, 0.5 within three, else 0
pub fn responsiveness(now: DateTime<Utc>, last_heartbeat: DateTime<Utc>, interval_ms: u64) -> f64 {
    let age_ms = (now - last_heartbeat).num_milliseconds().max(0) as u64;
    let interval_ms = interval_ms.max(1);

    if age_ms < 2 * interval_ms {
        1.0
    } else if age_ms < 3 * interval_ms {
        0.5
    } else {
        0.0
    }
}

pub fn performance(recent_mean_ms: Option<f64>, expected_ms: u64) -> f64 {
    match recent_mean_ms {
        Some(mean) if mean > 0.0 => (expected_ms as f64 / mean).clamp(0.0, 1.0),
        _ => 1.0,
    }
}

pub fn reliability(completed: u64, failed: u64) -> f64 {
    let total = completed + failed;
    if total == 0 {
        1.0
    } else {
        completed as f64 / total as f64
    }
}

fn trend(previous: f64, current: f64) -> HealthTrend {
    let delta = current - previous;
    if delta > TREND_DEAD_BAND {
        HealthTrend::Improving
    } else if delta < -TREND_DEAD_BAND {
        HealthTrend::Degrading
    } else {
        HealthTrend::Stable
    }
}

fn issues(c: &HealthComponents) -> Vec<HealthIssue> {
    let mut issues = Vec::new();

    if c.responsiveness < 0.5 {
        issues.push(HealthIssue {
            kind: IssueKind::Communication,
            severity: if c.responsiveness < 0.2 {
                Severity::Critical
            } else {
                Severity::High
            },
            message: "Agent is not sending heartbeats".to_string(),
            recommended_action: "Check agent connectivity and restart if necessary".to_string(),
        });
    }

    if c.performance < 0.6 {
        issues.push(HealthIssue {
            kind: IssueKind::Performance,
            severity: if c.performance < 0.3 {
                Severity::High
            } else {
                Severity::Medium
            },
            message: "Agent tasks are running slower than expected".to_string(),
            recommended_action: "Reduce workload or review resource limits".to_string(),
        });
    }

    if c.reliability < 0.5 {
        issues.push(HealthIssue {
            kind: IssueKind::Reliability,
            severity: Severity::High,
            message: "More tasks are failing than succeeding".to_string(),
            recommended_action: "Inspect the agent error history".to_string(),
        });
    }

    if c.resource_usage < 0.4 {
        issues.push(HealthIssue {
            kind: IssueKind::Resource,
            severity: if c.resource_usage < 0.2 {
                Severity::Critical
            } else {
                Severity::High
            },
            message: "Agent is close to its resource limits".to_string(),
            recommended_action: "Increase limits or scale out".to_string(),
        });
    }

    issues
}

/// Caps automatic restarts per agent inside a sliding window
pub struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    history: Mutex<HashMap<AgentId, VecDeque<Instant>>>,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record an automatic restart if the budget allows it
    pub fn try_acquire(&self, agent_id: &str) -> bool {
        let now = Instant::now();
        let mut history = self.history.lock();
        let stamps = history.entry(agent_id.to_string()).or_default();

        while let Some(oldest) = stamps.front() {
            if now.duration_since(*oldest) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= self.max_restarts as usize {
            return false;
        }
        stamps.push_back(now);
        true
    }

    pub fn forget(&self, agent_id: &str) {
        self.history.lock().remove(agent_id);
    }
}
