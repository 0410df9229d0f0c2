//! `TaskRegistry` and `AgentRegistry` contracts (spec.md §2, §3 Ownership).

use crate::types::{Agent, Assignment, Task, TaskStatus};
use task_queue_common::error::Result;
use task_queue_common::ids::{AgentId, AssignmentId, TaskId};

/// Authoritative map of task metadata and lifecycle state. Owns `Task`
/// records exclusively — they are mutated only through this API.
pub trait TaskRegistry: Send + Sync {
    fn insert(&self, task: Task) -> Result<()>;
    fn get(&self, task_id: TaskId) -> Option<Task>;
    fn contains(&self, task_id: TaskId) -> bool;
    fn remove(&self, task_id: TaskId) -> Option<Task>;

    /// Transition a task's status, stamping `last_transition_at`.
    fn transition(&self, task_id: TaskId, status: TaskStatus, now: task_queue_common::DateTime<task_queue_common::Utc>) -> Result<()>;

    /// Overwrite the recorded attempt count (retry bookkeeping).
    fn set_attempts(&self, task_id: TaskId, attempts: u32) -> Result<()>;

    fn list_by_status(&self, status: TaskStatus) -> Vec<Task>;
    fn all(&self) -> Vec<Task>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every task. Used when restoring a snapshot over a running
    /// scheduler.
    fn clear(&self);
}

/// Pool of workers with capabilities, capacity, current load, heartbeats.
/// Owns `Agent` records exclusively.
pub trait AgentRegistry: Send + Sync {
    fn register(&self, agent: Agent) -> Result<()>;
    fn get(&self, agent_id: AgentId) -> Option<Agent>;
    fn contains(&self, agent_id: AgentId) -> bool;
    fn update(&self, agent_id: AgentId, f: &dyn Fn(&mut Agent)) -> Result<()>;
    fn all(&self) -> Vec<Agent>;

    fn heartbeat(&self, agent_id: AgentId, at: task_queue_common::DateTime<task_queue_common::Utc>) -> Result<()>;

    /// Agents whose last heartbeat is older than `timeout`.
    fn stale(&self, now: task_queue_common::DateTime<task_queue_common::Utc>, timeout: chrono::Duration) -> Vec<AgentId>;

    /// Drop every agent. Used when restoring a snapshot over a running
    /// scheduler.
    fn clear(&self);
}

/// Registry of in-flight assignments, mirrored by id into both the task
/// and the agent (spec.md §3 Ownership — owned by the scheduler, not by
/// `TaskRegistry`/`AgentRegistry`).
pub trait AssignmentTable: Send + Sync {
    fn insert(&self, assignment: Assignment);
    fn get(&self, assignment_id: AssignmentId) -> Option<Assignment>;
    fn get_for_task(&self, task_id: TaskId) -> Option<Assignment>;
    fn remove_for_task(&self, task_id: TaskId) -> Option<Assignment>;
    fn remove(&self, assignment_id: AssignmentId) -> Option<Assignment>;
    fn all(&self) -> Vec<Assignment>;
    fn count_for_agent(&self, agent_id: AgentId) -> usize;

    /// Drop every assignment. Used when restoring a snapshot over a running
    /// scheduler.
    fn clear(&self);
}
