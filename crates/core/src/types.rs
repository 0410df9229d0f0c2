//! Domain model: tasks, dependency edges, agents, assignments (spec.md §3).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use task_queue_common::ids::{AgentId, AssignmentId, EdgeId, TaskId};
use task_queue_common::{DateTime, Utc};

/// Task priority class. Ordered so `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Base-priority weight term from the PriorityScorer table (spec.md §4.2).
    #[must_use]
    pub fn weight(self) -> f64 {
        match self {
            Priority::Critical => 1000.0,
            Priority::High => 100.0,
            Priority::Normal => 10.0,
            Priority::Low => 1.0,
        }
    }
}

/// Task lifecycle state (spec.md §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    DeadLettered,
}

/// Parallelism mode constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelismMode {
    Sequential,
    Parallel,
    Exclusive,
}

/// Resource demand for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub cpu: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
}

/// Optional scheduling constraints on a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub required_agent: Option<AgentId>,
    pub required_capabilities: HashSet<String>,
    pub resource_demand: ResourceDemand,
    pub parallelism_mode: Option<ParallelismMode>,
}

/// Optional scheduling hints on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingHints {
    pub earliest_start: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for SchedulingHints {
    fn default() -> Self {
        Self {
            earliest_start: None,
            deadline: None,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Opaque handle passed to workers; the scheduler never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorHandle {
    pub name: String,
    pub parameters: serde_json::Value,
}

/// A unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub kind: String,
    pub priority: Priority,
    pub executor: ExecutorHandle,
    pub dependencies: HashSet<TaskId>,
    pub constraints: Constraints,
    pub scheduling: SchedulingHints,
    #[serde(with = "duration_millis")]
    pub estimated_duration: Duration,
    pub status: TaskStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub tags: HashSet<String>,
}

impl Task {
    /// `I6`: `attempts <= max_retries + 1`.
    #[must_use]
    pub fn exhausted_retries(&self) -> bool {
        self.attempts > self.scheduling.max_retries
    }
}

/// Kind of dependency edge. Only `Hard` gates readiness (spec.md §9 — the
/// clearer semantics chosen over the source's all-gating behavior).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Hard,
    Soft,
    Resource,
    Data,
    Conditional,
}

impl EdgeKind {
    #[must_use]
    pub fn is_gating(self) -> bool {
        matches!(self, EdgeKind::Hard)
    }
}

/// A dependency edge, pointing from prerequisite to dependent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: EdgeId,
    pub from: TaskId,
    pub to: TaskId,
    pub kind: EdgeKind,
    pub weight: f64,
}

/// Agent (worker) availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Offline,
    Maintenance,
}

/// Static capacity an agent declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCapacity {
    pub cpu: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub max_concurrent: u32,
}

/// Current resource usage of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentLoad {
    pub current_concurrent: u32,
    pub cpu_in_use: f64,
    pub memory_in_use: f64,
    pub disk_in_use: f64,
}

/// EWMA-style rolling performance for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub avg_completion_ms: f64,
    pub success_rate: f64,
    pub samples: u64,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            avg_completion_ms: 0.0,
            success_rate: 1.0,
            samples: 0,
        }
    }
}

impl AgentPerformance {
    /// EWMA smoothing factor applied on each observation.
    const ALPHA: f64 = 0.2;

    /// Fold a new completion observation into the rolling average.
    pub fn record(&mut self, completion_ms: f64, success: bool) {
        if self.samples == 0 {
            self.avg_completion_ms = completion_ms;
            self.success_rate = if success { 1.0 } else { 0.0 };
        } else {
            self.avg_completion_ms =
                Self::ALPHA * completion_ms + (1.0 - Self::ALPHA) * self.avg_completion_ms;
            let observed = if success { 1.0 } else { 0.0 };
            self.success_rate = Self::ALPHA * observed + (1.0 - Self::ALPHA) * self.success_rate;
        }
        self.samples += 1;
    }
}

/// A worker capable of executing tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub capabilities: HashSet<String>,
    pub capacity: AgentCapacity,
    pub load: AgentLoad,
    pub status: AgentStatus,
    pub performance: AgentPerformance,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Agent {
    #[must_use]
    pub fn has_free_capacity(&self) -> bool {
        self.load.current_concurrent < self.capacity.max_concurrent
    }

    #[must_use]
    pub fn has_capabilities(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    #[must_use]
    pub fn has_resource_headroom(&self, demand: &ResourceDemand) -> bool {
        self.load.cpu_in_use + demand.cpu <= self.capacity.cpu
            && self.load.memory_in_use + demand.memory_mb <= self.capacity.memory_mb
            && self.load.disk_in_use + demand.disk_mb <= self.capacity.disk_mb
    }
}

/// Binding between a task and an agent for one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: DateTime<Utc>,
    pub attempt: u32,
}

/// Outcome reported by a worker on completion ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success,
    TransientFailure { reason: String },
    PermanentFailure { reason: String },
}

/// Worker-reported execution metrics accompanying a completion ack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// Reason a task was cancelled.
pub type CancelReason = String;

/// Snapshot-friendly ordered map: spec.md §4.4/§6 require deterministic,
/// order-preserving serialization of every table, so every persisted
/// collection is a `Vec` of pairs rather than a `HashMap`.
pub type OrderedMap<K, V> = Vec<(K, V)>;

/// Convert a `HashMap` into a canonically (key-)ordered `OrderedMap`.
pub fn canonical_order<K: Ord + Clone, V: Clone>(map: &HashMap<K, V>) -> OrderedMap<K, V> {
    let mut entries: Vec<(K, V)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_strict() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn canonical_order_is_deterministic() {
        let mut map = HashMap::new();
        map.insert("b", 2);
        map.insert("a", 1);
        map.insert("c", 3);
        assert_eq!(canonical_order(&map), vec![("a", 1), ("b", 2), ("c", 3)]);
    }

    #[test]
    fn ewma_converges_toward_new_samples() {
        let mut perf = AgentPerformance::default();
        for _ in 0..50 {
            perf.record(10.0, true);
        }
        assert!((perf.avg_completion_ms - 10.0).abs() < 0.01);
        assert!((perf.success_rate - 1.0).abs() < 0.01);
    }
}
