//! PriorityScorer: a pure function from `(task, graph state, agent pool,
//! now)` to a scheduling score (spec.md §4.2).
//!
//! Deterministic and side-effect free by construction: it takes a plain
//! `ScoringInput` struct instead of reaching into the graph/registries
//! itself, which is what makes it independently property-testable.

use crate::types::{Priority, ResourceDemand};
use task_queue_common::{DateTime, Utc};

/// Everything the scorer needs, pre-computed by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput {
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub successor_count: usize,
    pub resource_demand: ResourceDemand,
    pub attempts: u32,
    pub now: DateTime<Utc>,
}

/// Compute the scheduling score. Higher sorts sooner.
#[must_use]
pub fn score(input: &ScoringInput) -> f64 {
    let base = input.priority.weight();
    let age = age_bonus(input.created_at, input.now);
    let deadline = deadline_urgency(input.deadline, input.now);
    let fanout = 5.0 * input.successor_count as f64;
    let resource = resource_efficiency(&input.resource_demand);
    let retry = -10.0 * f64::from(input.attempts);

    base + age + deadline + fanout + resource + retry
}

fn age_bonus(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_minutes = (now - created_at).num_seconds() as f64 / 60.0;
    (age_minutes * 0.1).max(0.0).min(50.0)
}

fn deadline_urgency(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(deadline) = deadline else {
        return 0.0;
    };
    let minutes_to_deadline = (deadline - now).num_seconds() as f64 / 60.0;
    if minutes_to_deadline < 0.0 {
        200.0
    } else {
        ((60.0 - minutes_to_deadline) * 2.0).max(0.0)
    }
}

fn resource_efficiency(demand: &ResourceDemand) -> f64 {
    let mem_penalty = (demand.memory_mb / 1000.0).min(20.0);
    let cpu_penalty = (demand.cpu * 10.0).min(20.0);
    let disk_penalty = (demand.disk_mb / 1_000_000.0).min(10.0);
    -(mem_penalty + cpu_penalty + disk_penalty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn base_input(now: DateTime<Utc>) -> ScoringInput {
        ScoringInput {
            priority: Priority::Normal,
            created_at: now,
            deadline: None,
            successor_count: 0,
            resource_demand: ResourceDemand::default(),
            attempts: 0,
            now,
        }
    }

    #[test]
    fn critical_always_outscores_non_critical_with_equal_context() {
        let now = Utc::now();
        let mut critical = base_input(now);
        critical.priority = Priority::Critical;
        let mut normal = base_input(now);
        normal.priority = Priority::Normal;
        // worst-case bonuses for normal task still can't close a 900pt gap
        normal.successor_count = 1000;
        assert!(score(&critical) > score(&normal));
    }

    #[test]
    fn age_bonus_is_capped_at_50() {
        let now = Utc::now();
        let mut input = base_input(now);
        input.created_at = now - Duration::hours(10);
        assert!(age_bonus(input.created_at, input.now) <= 50.0);
    }

    #[test]
    fn overdue_deadline_adds_flat_200() {
        let now = Utc::now();
        assert_eq!(deadline_urgency(Some(now - Duration::minutes(1)), now), 200.0);
    }

    #[test]
    fn retry_penalty_grows_linearly() {
        let now = Utc::now();
        let mut zero = base_input(now);
        zero.attempts = 0;
        let mut three = base_input(now);
        three.attempts = 3;
        assert!((score(&zero) - score(&three) - 30.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn score_is_deterministic_for_same_input(attempts in 0u32..10, successors in 0usize..50) {
            let now = Utc::now();
            let mut input = base_input(now);
            input.attempts = attempts;
            input.successor_count = successors;
            prop_assert_eq!(score(&input), score(&input));
        }
    }
}
