// packages/fleet/src/runtime/resource_limiter.rs
//! Resource limits and usage accounting for agent processes
//!
//! Limits are declared per agent (from its template, optionally overridden).
//! Agents report usage samples; the limiter turns a sample into a headroom
//! score for the health monitor and flags limit breaches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_CPU_QUOTA: u64 = 400;
const MIN_MEMORY_MB: u64 = 64;
const MAX_MEMORY_MB: u64 = 16 * 1024;

/// Per-agent resource ceilings; `None` leaves a dimension unlimited
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Percent of one core, so 200 is two full cores
    pub cpu_quota: Option<u32>,

    pub memory_limit_mb: Option<u64>,

    /// Work, tmp and log directories combined
    pub disk_limit_mb: Option<u64>,

    pub network_bandwidth_mbps: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_quota: Some(50),
            memory_limit_mb: Some(512),
            disk_limit_mb: Some(1024),
            network_bandwidth_mbps: None,
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            cpu_quota: None,
            memory_limit_mb: None,
            disk_limit_mb: None,
            network_bandwidth_mbps: None,
        }
    }

    /// Reject ceilings no agent could run under. The error lists every
    /// offending dimension.
    pub fn validate(&self) -> Result<(), String> {
        let bounds = [
            ("cpu_quota", self.cpu_quota.map(u64::from), 1, MAX_CPU_QUOTA),
            ("memory_limit_mb", self.memory_limit_mb, MIN_MEMORY_MB, MAX_MEMORY_MB),
            ("disk_limit_mb", self.disk_limit_mb, 1, u64::MAX),
            (
                "network_bandwidth_mbps",
                self.network_bandwidth_mbps.map(u64::from),
                1,
                u64::MAX,
            ),
        ];

        let problems: Vec<String> = bounds
            .into_iter()
            .filter_map(|(name, value, min, max)| match value {
                Some(v) if v < min => Some(format!("{} must be at least {} (got {})", name, min, v)),
                Some(v) if v > max => Some(format!("{} must be at most {} (got {})", name, max, v)),
                _ => None,
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

/// A resource usage sample reported by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub disk_mb: f64,
    pub network_mbps: f64,
    pub timestamp: DateTime<Utc>,
}

impl ResourceUsage {
    pub fn new(memory_mb: f64, cpu_percent: f64, disk_mb: f64, network_mbps: f64) -> Self {
        Self {
            memory_mb,
            cpu_percent,
            disk_mb,
            network_mbps,
            timestamp: Utc::now(),
        }
    }
}

/// Headroom left in one dimension: `1 - used/limit`, clamped to [0, 1].
/// An unlimited dimension always has full headroom.
fn headroom(used: f64, limit: Option<f64>) -> f64 {
    match limit {
        Some(limit) if limit > 0.0 => (1.0 - used / limit).clamp(0.0, 1.0),
        _ => 1.0,
    }
}

/// Compares reported usage against declared limits
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimiter;

impl ResourceLimiter {
    /// Mean headroom over memory, cpu and disk. 1.0 when nothing has been
    /// reported yet; NaN if the sample itself is NaN.
    pub fn headroom_score(&self, limits: &ResourceLimits, usage: Option<&ResourceUsage>) -> f64 {
        let Some(usage) = usage else {
            return 1.0;
        };

        let memory = headroom(usage.memory_mb, limits.memory_limit_mb.map(|v| v as f64));
        let cpu = headroom(usage.cpu_percent, limits.cpu_quota.map(|v| v as f64));
        let disk = headroom(usage.disk_mb, limits.disk_limit_mb.map(|v| v as f64));

        (memory + cpu + disk) / 3.0
    }

    /// Describe every dimension in which `usage` exceeds `limits`
    pub fn violations(&self, limits: &ResourceLimits, usage: &ResourceUsage) -> Vec<String> {
        let mut violations = Vec::new();

        if let Some(limit) = limits.memory_limit_mb {
            if usage.memory_mb > limit as f64 {
                violations.push(format!("memory {:.0}MB > {}MB", usage.memory_mb, limit));
            }
        }
        if let Some(limit) = limits.cpu_quota {
            if usage.cpu_percent > limit as f64 {
                violations.push(format!("cpu {:.1}% > {}%", usage.cpu_percent, limit));
            }
        }
        if let Some(limit) = limits.disk_limit_mb {
            if usage.disk_mb > limit as f64 {
                violations.push(format!("disk {:.0}MB > {}MB", usage.disk_mb, limit));
            }
        }
        if let Some(limit) = limits.network_bandwidth_mbps {
            if usage.network_mbps > limit as f64 {
                violations.push(format!("network {:.1}Mbps > {}Mbps", usage.network_mbps, limit));
            }
        }

        violations
    }
}
