// packages/fleet/src/scaling/cluster.rs
//! Agent clusters
//!
//! A cluster groups existing agents (of any template) under a coordinator
//! and hands out members to callers by strategy. Selection only considers
//! IDLE or BUSY members that have spare task slots.

use crate::registry::agent::{Agent, AgentId};
use crate::utils::errors::{FleetError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentStrategy {
    RoundRobin,
    LoadBased,
    CapabilityBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCluster {
    pub id: String,
    pub name: String,
    pub members: Vec<AgentId>,
    pub coordinator: Option<AgentId>,
    pub strategy: AssignmentStrategy,
    pub max_size: usize,
    pub auto_scale: bool,
    pub created_at: DateTime<Utc>,
    cursor: usize,
}

impl AgentCluster {
    /// Members are deduplicated in order; the first becomes coordinator
    pub fn new(
        id: String,
        name: impl Into<String>,
        members: Vec<AgentId>,
        strategy: AssignmentStrategy,
        max_size: usize,
    ) -> Result<Self> {
        let mut unique: Vec<AgentId> = Vec::with_capacity(members.len());
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }

        if unique.len() > max_size {
            return Err(FleetError::ClusterFull {
                cluster_id: id,
                max_size,
            });
        }

        Ok(Self {
            coordinator: unique.first().cloned(),
            id,
            name: name.into(),
            members: unique,
            strategy,
            max_size,
            auto_scale: false,
            created_at: Utc::now(),
            cursor: 0,
        })
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.members.iter().any(|m| m == agent_id)
    }

    /// Add a member; `Ok(false)` if it already belongs to the cluster
    pub fn add_member(&mut self, agent_id: AgentId) -> Result<bool> {
        if self.contains(&agent_id) {
            return Ok(false);
        }
        if self.members.len() >= self.max_size {
            return Err(FleetError::ClusterFull {
                cluster_id: self.id.clone(),
                max_size: self.max_size,
            });
        }
        if self.coordinator.is_none() {
            self.coordinator = Some(agent_id.clone());
        }
        self.members.push(agent_id);
        Ok(true)
    }

    /// Remove a member. A removed coordinator is replaced by the member
    /// that followed it (wrapping), or by nobody if the cluster is empty.
    pub fn remove_member(&mut self, agent_id: &str) -> bool {
        let Some(pos) = self.members.iter().position(|m| m == agent_id) else {
            return false;
        };
        self.members.remove(pos);

        if self.coordinator.as_deref() == Some(agent_id) {
            self.coordinator = if self.members.is_empty() {
                None
            } else {
                Some(self.members[pos % self.members.len()].clone())
            };
        }

        if self.cursor > pos {
            self.cursor -= 1;
        }
        true
    }

    /// Pick a member for work.
    ///
    /// `agents` are the current records of the members (any order, missing
    /// ones are skipped). `capability` restricts candidates to members whose
    /// skills or task types include it.
    pub fn select(&mut self, agents: &[Agent], capability: Option<&str>) -> Option<AgentId> {
        let eligible = |agent: &Agent| {
            agent.status.is_running()
                && agent.workload.current_tasks < agent.workload.max_tasks
                && capability.map_or(true, |c| agent.capabilities.supports(c))
        };

        let candidates: Vec<&Agent> = self
            .members
            .iter()
            .filter_map(|id| agents.iter().find(|a| &a.id == id))
            .filter(|a| eligible(a))
            .collect();

        match self.strategy {
            AssignmentStrategy::RoundRobin => {
                let len = self.members.len();
                for step in 0..len {
                    let idx = (self.cursor + step) % len;
                    let id = &self.members[idx];
                    if candidates.iter().any(|a| &a.id == id) {
                        self.cursor = (idx + 1) % len;
                        return Some(id.clone());
                    }
                }
                None
            }
            AssignmentStrategy::LoadBased => candidates
                .iter()
                .min_by(|a, b| by_load(a, b))
                .map(|a| a.id.clone()),
            AssignmentStrategy::CapabilityBased => candidates
                .iter()
                .min_by(|a, b| {
                    b.health
                        .overall
                        .partial_cmp(&a.health.overall)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| by_load(a, b))
                })
                .map(|a| a.id.clone()),
        }
    }
}

fn by_load(a: &Agent, b: &Agent) -> Ordering {
    a.workload
        .utilization_rate
        .partial_cmp(&b.workload.utilization_rate)
        .unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::agent::AgentStatus;
    use crate::registry::template::{AgentOverrides, AgentTemplate};
    use std::path::Path;

    fn agent(id: &str, skills: &[&str], tasks: u32) -> Agent {
        let mut template = AgentTemplate::new("t", "worker");
        template.capabilities.skills = skills.iter().map(|s| s.to_string()).collect();
        let mut agent =
            template.instantiate(id.to_string(), &AgentOverrides::default(), Path::new("/tmp"));
        agent.status = AgentStatus::Idle;
        for _ in 0..tasks {
            agent.workload.assign();
        }
        agent
    }

    fn cluster(strategy: AssignmentStrategy) -> AgentCluster {
        AgentCluster::new(
            "cluster_1".to_string(),
            "team",
            vec!["a".into(), "b".into(), "c".into()],
            strategy,
            4,
        )
        .unwrap()
    }

    #[test]
    fn test_first_member_is_coordinator() {
        let cluster = cluster(AssignmentStrategy::RoundRobin);
        assert_eq!(cluster.coordinator.as_deref(), Some("a"));
    }

    #[test]
    fn test_capacity() {
        let mut cluster = cluster(AssignmentStrategy::RoundRobin);
        assert!(cluster.add_member("d".into()).unwrap());
        assert!(!cluster.add_member("d".into()).unwrap());
        assert!(matches!(
            cluster.add_member("e".into()),
            Err(FleetError::ClusterFull { max_size: 4, .. })
        ));

        let result = AgentCluster::new(
            "c2".to_string(),
            "big",
            vec!["a".into(), "b".into()],
            AssignmentStrategy::RoundRobin,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_coordinator_reelected() {
        let mut cluster = cluster(AssignmentStrategy::RoundRobin);
        assert!(cluster.remove_member("a"));
        assert_eq!(cluster.coordinator.as_deref(), Some("b"));
        assert!(cluster.remove_member("c"));
        assert_eq!(cluster.coordinator.as_deref(), Some("b"));
        assert!(cluster.remove_member("b"));
        assert_eq!(cluster.coordinator, None);
        assert!(!cluster.remove_member("b"));
    }

    #[test]
    fn test_round_robin() {
        let mut cluster = cluster(AssignmentStrategy::RoundRobin);
        let agents = vec![agent("a", &[], 0), agent("b", &[], 0), agent("c", &[], 0)];
        let picks: Vec<_> = (0..4).filter_map(|_| cluster.select(&agents, None)).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_round_robin_skips_ineligible() {
        let mut cluster = cluster(AssignmentStrategy::RoundRobin);
        let mut offline = agent("b", &[], 0);
        offline.status = AgentStatus::Offline;
        let agents = vec![agent("a", &[], 0), offline, agent("c", &[], 0)];
        let picks: Vec<_> = (0..3).filter_map(|_| cluster.select(&agents, None)).collect();
        assert_eq!(picks, vec!["a", "c", "a"]);
    }

    #[test]
    fn test_load_based() {
        let mut cluster = cluster(AssignmentStrategy::LoadBased);
        let agents = vec![agent("a", &[], 3), agent("b", &[], 1), agent("c", &[], 2)];
        assert_eq!(cluster.select(&agents, None).as_deref(), Some("b"));
    }

    #[test]
    fn test_capability_based() {
        let mut cluster = cluster(AssignmentStrategy::CapabilityBased);
        let mut strong = agent("c", &["rust"], 0);
        strong.health.overall = 0.95;
        let mut weak = agent("a", &["rust"], 0);
        weak.health.overall = 0.5;
        let agents = vec![weak, agent("b", &["python"], 0), strong];

        assert_eq!(cluster.select(&agents, Some("rust")).as_deref(), Some("c"));
        assert_eq!(cluster.select(&agents, Some("python")).as_deref(), Some("b"));
        assert_eq!(cluster.select(&agents, Some("go")), None);
    }

    #[test]
    fn test_saturated_members_skipped() {
        let mut cluster = cluster(AssignmentStrategy::LoadBased);
        let agents = vec![agent("a", &[], 5), agent("b", &[], 5), agent("c", &[], 5)];
        assert_eq!(cluster.select(&agents, None), None);
    }
}
