// packages/fleet/src/registry/store.rs
//! In-memory agent state store
//!
//! Holds every agent record together with its bounded performance and
//! resource-usage histories. Each record is locked independently (`DashMap`
//! shard locks), so monitors can update one agent without blocking others.
//! Closures passed to `update` must not await or call back into the store.

use crate::registry::agent::{Agent, AgentId, AgentStatus};
use crate::runtime::resource_limiter::ResourceUsage;
use crate::utils::errors::{FleetError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum samples kept per history
pub const MAX_HISTORY: usize = 100;

/// One finished task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSample {
    pub execution_time_ms: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// An agent with its histories
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub agent: Agent,
    pub performance: VecDeque<TaskSample>,
    pub resources: VecDeque<ResourceUsage>,
}

impl AgentEntry {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            performance: VecDeque::new(),
            resources: VecDeque::new(),
        }
    }

    pub fn push_task(&mut self, sample: TaskSample) {
        if self.performance.len() >= MAX_HISTORY {
            self.performance.pop_front();
        }
        self.performance.push_back(sample);
    }

    pub fn push_usage(&mut self, usage: ResourceUsage) {
        if self.resources.len() >= MAX_HISTORY {
            self.resources.pop_front();
        }
        self.resources.push_back(usage);
    }

    pub fn latest_usage(&self) -> Option<&ResourceUsage> {
        self.resources.back()
    }

    /// Mean execution time of the last `window` tasks
    pub fn recent_execution_ms(&self, window: usize) -> Option<f64> {
        let recent: Vec<f64> = self
            .performance
            .iter()
            .rev()
            .take(window)
            .map(|s| s.execution_time_ms)
            .collect();

        if recent.is_empty() {
            None
        } else {
            Some(recent.iter().sum::<f64>() / recent.len() as f64)
        }
    }
}

/// Registry of all agents
#[derive(Default)]
pub struct AgentRegistry {
    entries: DashMap<AgentId, AgentEntry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new agent unless the registry already holds `max_agents`
    pub fn insert(&self, agent: Agent, max_agents: usize) -> Result<()> {
        if self.entries.len() >= max_agents {
            return Err(FleetError::CapacityExceeded { max: max_agents });
        }
        self.entries.insert(agent.id.clone(), AgentEntry::new(agent));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.entries.get(id).map(|e| e.agent.clone())
    }

    pub fn entry(&self, id: &str) -> Option<AgentEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn status(&self, id: &str) -> Option<AgentStatus> {
        self.entries.get(id).map(|e| e.agent.status)
    }

    /// Mutate one entry in place
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut AgentEntry) -> R) -> Option<R> {
        self.entries.get_mut(id).map(|mut e| f(e.value_mut()))
    }

    /// Set a new status, returning the previous one
    pub fn set_status(&self, id: &str, status: AgentStatus) -> Option<AgentStatus> {
        self.update(id, |e| std::mem::replace(&mut e.agent.status, status))
    }

    pub fn remove(&self, id: &str) -> Option<AgentEntry> {
        self.entries.remove(id).map(|(_, e)| e)
    }

    /// All agents, oldest first
    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.entries.iter().map(|e| e.agent.clone()).collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    pub fn filter(&self, predicate: impl Fn(&Agent) -> bool) -> Vec<Agent> {
        self.list().into_iter().filter(|a| predicate(a)).collect()
    }
}
