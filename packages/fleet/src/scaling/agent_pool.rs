// packages/fleet/src/scaling/agent_pool.rs
//! Agent pools
//!
//! A pool is a named group of agents built from one template and kept
//! between `min_size` and `max_size`. Members sit in one of two sets:
//!
//! ```text
//! AgentPool
//! ├─ Available: [Agent1, Agent2, ...]  (oldest first)
//! └─ Busy: [Agent3, Agent4, ...]       (BUSY status)
//! ```
//!
//! `current_size` is always `available + busy`. The pool only tracks
//! membership; creating, starting and removing agents is done by the
//! manager.

use crate::registry::agent::AgentId;
use crate::scaling::policy::ScalingPolicy;
use crate::utils::errors::{FleetError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Creation options for a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub auto_scale: bool,

    /// Utilisation above which the pool grows
    pub scale_up_threshold: f64,

    /// Utilisation below which the pool shrinks
    pub scale_down_threshold: f64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            auto_scale: false,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<()> {
        if self.min_size > self.max_size {
            return Err(FleetError::OutOfRange {
                target: self.min_size,
                min: 0,
                max: self.max_size,
            });
        }
        if !(0.0..=1.0).contains(&self.scale_down_threshold)
            || !(0.0..=1.0).contains(&self.scale_up_threshold)
            || self.scale_down_threshold > self.scale_up_threshold
        {
            return Err(FleetError::InvalidConfig(format!(
                "invalid scale thresholds: up {} / down {}",
                self.scale_up_threshold, self.scale_down_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPool {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub template: String,
    pub min_size: usize,
    pub max_size: usize,
    pub auto_scale: bool,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,

    /// Attached policy; the autoscaler derives one from the thresholds if unset
    pub policy: Option<ScalingPolicy>,

    pub last_scaled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,

    available: VecDeque<AgentId>,
    busy: Vec<AgentId>,
}

impl AgentPool {
    pub fn new(
        id: String,
        name: impl Into<String>,
        agent_type: impl Into<String>,
        template: impl Into<String>,
        options: &PoolOptions,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            agent_type: agent_type.into(),
            template: template.into(),
            min_size: options.min_size,
            max_size: options.max_size,
            auto_scale: options.auto_scale,
            scale_up_threshold: options.scale_up_threshold,
            scale_down_threshold: options.scale_down_threshold,
            policy: None,
            last_scaled_at: None,
            created_at: Utc::now(),
            available: VecDeque::new(),
            busy: Vec::new(),
        }
    }

    pub fn current_size(&self) -> usize {
        self.available.len() + self.busy.len()
    }

    pub fn available(&self) -> impl Iterator<Item = &AgentId> {
        self.available.iter()
    }

    pub fn busy(&self) -> impl Iterator<Item = &AgentId> {
        self.busy.iter()
    }

    /// All members, available first
    pub fn members(&self) -> Vec<AgentId> {
        self.available.iter().chain(self.busy.iter()).cloned().collect()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.available.iter().any(|a| a == agent_id) || self.busy.iter().any(|a| a == agent_id)
    }

    /// Busy members over all members; 0 for an empty pool
    pub fn utilization(&self) -> f64 {
        match self.current_size() {
            0 => 0.0,
            size => self.busy.len() as f64 / size as f64,
        }
    }

    /// `OutOfRange` unless `target` lies in `[min_size, max_size]`
    pub fn check_target(&self, target: usize) -> Result<()> {
        if target < self.min_size || target > self.max_size {
            return Err(FleetError::OutOfRange {
                target,
                min: self.min_size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    /// Add a new member to the back of the available set
    pub fn add_available(&mut self, agent_id: AgentId) {
        if !self.contains(&agent_id) {
            self.available.push_back(agent_id);
        }
    }

    /// Move a member into the busy set; false if it is not a member
    pub fn mark_busy(&mut self, agent_id: &str) -> bool {
        if let Some(pos) = self.available.iter().position(|a| a == agent_id) {
            if let Some(id) = self.available.remove(pos) {
                self.busy.push(id);
            }
            return true;
        }
        self.busy.iter().any(|a| a == agent_id)
    }

    /// Move a member back to the available set; false if it is not a member
    pub fn mark_available(&mut self, agent_id: &str) -> bool {
        if let Some(pos) = self.busy.iter().position(|a| a == agent_id) {
            let id = self.busy.remove(pos);
            self.available.push_back(id);
            return true;
        }
        self.available.iter().any(|a| a == agent_id)
    }

    /// Oldest member of the available set
    pub fn oldest_available(&self) -> Option<&AgentId> {
        self.available.front()
    }

    /// Drop a member from whichever set holds it
    pub fn remove(&mut self, agent_id: &str) -> bool {
        if let Some(pos) = self.available.iter().position(|a| a == agent_id) {
            self.available.remove(pos);
            return true;
        }
        if let Some(pos) = self.busy.iter().position(|a| a == agent_id) {
            self.busy.remove(pos);
            return true;
        }
        false
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_id: self.id.clone(),
            name: self.name.clone(),
            current_size: self.current_size(),
            available_agents: self.available.len(),
            busy_agents: self.busy.len(),
            min_size: self.min_size,
            max_size: self.max_size,
            utilization: self.utilization(),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_id: String,
    pub name: String,
    pub current_size: usize,
    pub available_agents: usize,
    pub busy_agents: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub utilization: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(min: usize, max: usize) -> AgentPool {
        let options = PoolOptions {
            min_size: min,
            max_size: max,
            ..Default::default()
        };
        AgentPool::new("pool_1".to_string(), "workers", "worker", "coder", &options)
    }

    #[test]
    fn test_options_validation() {
        let options = PoolOptions {
            min_size: 5,
            max_size: 2,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(FleetError::OutOfRange { .. })));

        let options = PoolOptions {
            scale_up_threshold: 0.1,
            scale_down_threshold: 0.5,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(FleetError::InvalidConfig(_))));
        assert!(PoolOptions::default().validate().is_ok());
    }

    #[test]
    fn test_membership_preserves_size() {
        let mut pool = pool(0, 5);
        pool.add_available("a1".to_string());
        pool.add_available("a2".to_string());
        pool.add_available("a3".to_string());
        pool.add_available("a1".to_string());
        assert_eq!(pool.current_size(), 3);

        assert!(pool.mark_busy("a2"));
        assert!(pool.mark_busy("a2"));
        assert_eq!(pool.current_size(), 3);
        assert_eq!(pool.busy().count(), 1);
        assert!((pool.utilization() - 1.0 / 3.0).abs() < 1e-9);

        assert!(pool.mark_available("a2"));
        assert_eq!(pool.current_size(), 3);
        assert_eq!(pool.oldest_available().map(String::as_str), Some("a1"));

        assert!(!pool.mark_busy("stranger"));
        assert!(pool.remove("a1"));
        assert!(!pool.remove("a1"));
        assert_eq!(pool.current_size(), 2);
        assert_eq!(pool.oldest_available().map(String::as_str), Some("a3"));
    }

    #[test]
    fn test_target_range() {
        let pool = pool(2, 5);
        assert!(pool.check_target(2).is_ok());
        assert!(pool.check_target(5).is_ok());
        assert!(matches!(
            pool.check_target(10),
            Err(FleetError::OutOfRange { target: 10, min: 2, max: 5 })
        ));
        assert!(pool.check_target(1).is_err());
    }

    #[test]
    fn test_empty_pool_stats() {
        let stats = pool(0, 3).stats();
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.utilization, 0.0);
    }
}
