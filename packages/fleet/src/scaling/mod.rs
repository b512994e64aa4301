// packages/fleet/src/scaling/mod.rs
//! Pools, clusters and scaling policies
//!
//! - **Agent Pool**: template-bound group kept within a size range
//! - **Cluster**: ad-hoc group with a coordinator and assignment strategy
//! - **Policy**: rule-based, cooldown-limited scaling recommendations

pub mod agent_pool;
pub mod cluster;
pub mod policy;

pub use agent_pool::{AgentPool, PoolOptions, PoolStats};
pub use cluster::{AgentCluster, AssignmentStrategy};
pub use policy::{
    Comparator, PoolMetrics, ScalingAction, ScalingDecision, ScalingMetric, ScalingPolicy,
    ScalingRule,
};
