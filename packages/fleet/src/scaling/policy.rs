// packages/fleet/src/scaling/policy.rs
//! Scaling policies
//!
//! A policy is an ordered list of threshold rules over pool metrics. The
//! first matching rule wins. Evaluation is advisory: it never touches the
//! pool. Applying a decision is recorded with `record_operation`, which is
//! what the cooldown and the per-window operation cap count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Pool metric a rule looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    /// Busy members / all members
    Utilization,

    /// Mean overall health of the members
    AverageHealth,

    /// Mean task error rate of the members
    ErrorRate,

    /// Current member count
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Above,
    Below,
}

impl Comparator {
    fn matches(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Above => value > threshold,
            Comparator::Below => value < threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRule {
    pub metric: ScalingMetric,
    pub comparator: Comparator,
    pub threshold: f64,
    pub action: ScalingAction,

    /// Agents added or removed when the rule fires
    pub amount: usize,
}

/// Snapshot of the numbers rules are evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub utilization: f64,
    pub average_health: f64,
    pub error_rate: f64,
    pub size: usize,
}

impl PoolMetrics {
    fn value(&self, metric: ScalingMetric) -> f64 {
        match metric {
            ScalingMetric::Utilization => self.utilization,
            ScalingMetric::AverageHealth => self.average_health,
            ScalingMetric::ErrorRate => self.error_rate,
            ScalingMetric::Size => self.size as f64,
        }
    }
}

/// Recommendation produced by a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub amount: usize,
    pub reason: String,
}

impl ScalingDecision {
    /// Target size for a pool currently holding `current`, clamped to its range
    pub fn target(&self, current: usize, min: usize, max: usize) -> usize {
        let target = match self.action {
            ScalingAction::ScaleUp => current.saturating_add(self.amount),
            ScalingAction::ScaleDown => current.saturating_sub(self.amount),
        };
        target.clamp(min, max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub name: String,
    pub enabled: bool,
    pub rules: Vec<ScalingRule>,

    /// Length of the window that `max_operations` applies to
    pub cooldown_secs: u64,

    /// Operations allowed per cooldown window
    pub max_operations: u32,

    #[serde(skip)]
    operations: VecDeque<DateTime<Utc>>,
}

impl ScalingPolicy {
    pub fn new(name: impl Into<String>, cooldown_secs: u64) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            rules: vec![],
            cooldown_secs,
            max_operations: 1,
            operations: VecDeque::new(),
        }
    }

    pub fn with_rule(mut self, rule: ScalingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_max_operations(mut self, max_operations: u32) -> Self {
        self.max_operations = max_operations;
        self
    }

    /// The policy implied by a pool's utilisation thresholds
    pub fn from_thresholds(scale_up: f64, scale_down: f64, cooldown_secs: u64) -> Self {
        Self::new("utilization-thresholds", cooldown_secs)
            .with_rule(ScalingRule {
                metric: ScalingMetric::Utilization,
                comparator: Comparator::Above,
                threshold: scale_up,
                action: ScalingAction::ScaleUp,
                amount: 1,
            })
            .with_rule(ScalingRule {
                metric: ScalingMetric::Utilization,
                comparator: Comparator::Below,
                threshold: scale_down,
                action: ScalingAction::ScaleDown,
                amount: 1,
            })
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs.min(i64::MAX as u64) as i64)
    }

    /// True if another operation would exceed the per-window cap
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        let since = now - self.window();
        let recent = self.operations.iter().filter(|t| **t > since).count();
        recent >= self.max_operations as usize
    }

    /// First matching rule, unless disabled or cooling down
    pub fn evaluate(&self, metrics: &PoolMetrics, now: DateTime<Utc>) -> Option<ScalingDecision> {
        if !self.enabled || self.in_cooldown(now) {
            return None;
        }

        self.rules.iter().find_map(|rule| {
            let value = metrics.value(rule.metric);
            rule.comparator
                .matches(value, rule.threshold)
                .then(|| ScalingDecision {
                    action: rule.action,
                    amount: rule.amount,
                    reason: format!(
                        "{}: {:?} {:.2} {:?} {:.2}",
                        self.name, rule.metric, value, rule.comparator, rule.threshold
                    ),
                })
        })
    }

    /// Count an applied operation against the window
    pub fn record_operation(&mut self, now: DateTime<Utc>) {
        let since = now - self.window();
        self.operations.retain(|t| *t > since);
        self.operations.push_back(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(utilization: f64) -> PoolMetrics {
        PoolMetrics {
            utilization,
            average_health: 1.0,
            error_rate: 0.0,
            size: 3,
        }
    }

    #[test]
    fn test_threshold_policy() {
        let policy = ScalingPolicy::from_thresholds(0.8, 0.2, 60);
        let now = Utc::now();

        let up = policy.evaluate(&metrics(0.9), now).unwrap();
        assert_eq!(up.action, ScalingAction::ScaleUp);
        assert_eq!(up.amount, 1);

        let down = policy.evaluate(&metrics(0.1), now).unwrap();
        assert_eq!(down.action, ScalingAction::ScaleDown);

        assert!(policy.evaluate(&metrics(0.5), now).is_none());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = ScalingPolicy::new("health-first", 0)
            .with_rule(ScalingRule {
                metric: ScalingMetric::AverageHealth,
                comparator: Comparator::Below,
                threshold: 0.5,
                action: ScalingAction::ScaleUp,
                amount: 2,
            })
            .with_rule(ScalingRule {
                metric: ScalingMetric::Size,
                comparator: Comparator::Above,
                threshold: 1.0,
                action: ScalingAction::ScaleDown,
                amount: 1,
            });

        let mut m = metrics(0.5);
        m.average_health = 0.2;
        assert_eq!(policy.evaluate(&m, Utc::now()).unwrap().amount, 2);

        m.average_health = 0.9;
        assert_eq!(
            policy.evaluate(&m, Utc::now()).unwrap().action,
            ScalingAction::ScaleDown
        );
    }

    #[test]
    fn test_cooldown_caps_operations() {
        let mut policy = ScalingPolicy::from_thresholds(0.8, 0.2, 60).with_max_operations(2);
        let now = Utc::now();

        policy.record_operation(now);
        assert!(policy.evaluate(&metrics(0.9), now).is_some());

        policy.record_operation(now);
        assert!(policy.in_cooldown(now));
        assert!(policy.evaluate(&metrics(0.9), now).is_none());

        let later = now + chrono::Duration::seconds(61);
        assert!(!policy.in_cooldown(later));
    }

    #[test]
    fn test_disabled_policy_is_silent() {
        let mut policy = ScalingPolicy::from_thresholds(0.8, 0.2, 0);
        policy.enabled = false;
        assert!(policy.evaluate(&metrics(1.0), Utc::now()).is_none());
    }

    #[test]
    fn test_decision_target_clamped() {
        let decision = ScalingDecision {
            action: ScalingAction::ScaleUp,
            amount: 5,
            reason: String::new(),
        };
        assert_eq!(decision.target(3, 1, 6), 6);

        let decision = ScalingDecision {
            action: ScalingAction::ScaleDown,
            amount: 5,
            reason: String::new(),
        };
        assert_eq!(decision.target(3, 2, 6), 2);
    }
}
