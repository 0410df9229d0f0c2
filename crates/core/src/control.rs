//! Control API: the command/response pair external callers use to drive a
//! scheduler (spec.md §6). Expressed as a closed enum pair rather than a
//! string-dispatched RPC surface, mirroring `events::Event`.

use crate::persistence::RestoreCounts;
use crate::types::{
    Agent, AgentPerformance, AgentStatus, Assignment, CancelReason, ExecutorHandle, Priority, Task,
    TaskOutcome, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use task_queue_common::ids::{AgentId, AssignmentId, TaskId};
use task_queue_common::metrics::WindowStats;

/// A new task submission, before an id/timestamps are assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub kind: String,
    pub priority: Priority,
    pub executor: ExecutorHandle,
    pub dependencies: HashSet<TaskId>,
    pub constraints: crate::types::Constraints,
    pub scheduling: crate::types::SchedulingHints,
    pub estimated_duration_ms: u64,
    pub tags: HashSet<String>,
}

/// Everything one command against the scheduler can request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    SubmitTask(NewTask),
    CancelTask { task_id: TaskId, reason: CancelReason },
    RegisterAgent { agent_id: AgentId, capabilities: HashSet<String>, capacity: crate::types::AgentCapacity },
    UpdateAgent { agent_id: AgentId, status: AgentStatus },
    Heartbeat { agent_id: AgentId },
    AckCompletion { assignment_id: AssignmentId, outcome: TaskOutcome, metrics: crate::types::ExecutionMetrics },
    QueueStatus,
    TaskInfo { task_id: TaskId },
    Rebalance,
    Snapshot { label: Option<String> },
    Restore,
}

/// Aggregate queue status (spec.md §6 `QueueStatus`: counts, next task, perf
/// snapshot).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatusReport {
    pub pending: usize,
    pub queued: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub agents_available: usize,
    pub agents_busy: usize,
    /// The task `advance()` would assign next, if any agent has headroom.
    pub next_task: Option<TaskId>,
    /// Fleet-wide performance snapshot, agent samples pooled together.
    pub perf_snapshot: AgentPerformance,
    /// Rolling-window throughput/latency stats, absent when no window
    /// manager is attached to the scheduler.
    pub perf_window: Option<WindowStats>,
}

/// Detail returned by `TaskInfo` (spec.md §6: task + assignment + queue
/// position + deps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfoReport {
    pub task: Task,
    pub assignment: Option<Assignment>,
    /// Rank of this task among all `Queued` tasks, ordered the same way
    /// `advance()` ranks them for assignment. `None` once the task has left
    /// `Queued`.
    pub queue_position: Option<usize>,
    pub dependencies: HashSet<TaskId>,
}

/// Response matching the `Command` that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    TaskSubmitted { task_id: TaskId },
    TaskCancelled { task_id: TaskId },
    AgentRegistered { agent_id: AgentId },
    AgentUpdated { agent_id: AgentId },
    HeartbeatAcked { agent_id: AgentId },
    CompletionAcked { task_id: TaskId, new_status: TaskStatus },
    QueueStatus(QueueStatusReport),
    TaskInfo(Option<TaskInfoReport>),
    Rebalanced { queued_count: usize },
    Snapshotted { path: PathBuf },
    Restored(RestoreCounts),
    Error { message: String },
}

impl QueueStatusReport {
    #[must_use]
    pub fn from_tasks_and_agents(tasks: &[Task], agents: &[Agent]) -> Self {
        let mut report = QueueStatusReport::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => report.pending += 1,
                TaskStatus::Queued => report.queued += 1,
                TaskStatus::Assigned => report.assigned += 1,
                TaskStatus::Running => report.running += 1,
                TaskStatus::Completed => report.completed += 1,
                TaskStatus::Failed => report.failed += 1,
                TaskStatus::DeadLettered => report.dead_lettered += 1,
                TaskStatus::Cancelled => {}
            }
        }
        for agent in agents {
            match agent.status {
                AgentStatus::Available => report.agents_available += 1,
                AgentStatus::Busy => report.agents_busy += 1,
                AgentStatus::Offline | AgentStatus::Maintenance => {}
            }
        }
        report.perf_snapshot = pooled_performance(agents);
        report
    }
}

/// Pool every agent's EWMA performance into one fleet-wide snapshot, weighted
/// by each agent's sample count.
fn pooled_performance(agents: &[Agent]) -> AgentPerformance {
    let total_samples: u64 = agents.iter().map(|a| a.performance.samples).sum();
    if total_samples == 0 {
        return AgentPerformance::default();
    }
    let mut avg_completion_ms = 0.0;
    let mut success_rate = 0.0;
    for agent in agents {
        let weight = agent.performance.samples as f64 / total_samples as f64;
        avg_completion_ms += agent.performance.avg_completion_ms * weight;
        success_rate += agent.performance.success_rate * weight;
    }
    AgentPerformance {
        avg_completion_ms,
        success_rate,
        samples: total_samples,
    }
}
