//! `DependencyGraph` contract (spec.md §4.1).

use crate::types::{DependencyEdge, EdgeKind, Priority, Task};
use task_queue_common::error::Result;
use task_queue_common::ids::{EdgeId, TaskId};

/// Longest-duration chain of `Hard`-dependent tasks.
#[derive(Debug, Clone, Default)]
pub struct CriticalPath {
    pub nodes: Vec<TaskId>,
    pub total_ms: u64,
}

/// In-memory DAG of tasks and dependency edges.
///
/// `AddEdge` runs its cycle check *before* committing; on rejection the
/// graph is left byte-identical to its pre-call state (P2).
pub trait DependencyGraph: Send + Sync {
    fn add_task(&mut self, task_id: TaskId) -> Result<()>;
    fn remove_task(&mut self, task_id: TaskId) -> Result<()>;

    /// Drop every task and edge, returning the graph to its just-constructed
    /// state. Used when restoring a snapshot over a running scheduler.
    fn clear(&mut self);

    fn add_edge(&mut self, from: TaskId, to: TaskId, kind: EdgeKind, weight: f64)
        -> Result<EdgeId>;
    fn remove_edge(&mut self, edge_id: EdgeId);

    fn predecessors(&self, task_id: TaskId) -> Vec<DependencyEdge>;
    fn successors(&self, task_id: TaskId) -> Vec<DependencyEdge>;

    /// True iff every `Hard` predecessor is `Completed` and none is
    /// `DeadLettered`/`Cancelled`.
    fn is_ready(&self, task_id: TaskId, status_of: &dyn Fn(TaskId) -> Option<crate::types::TaskStatus>) -> bool;

    /// Level `0` = no `Hard` predecessors; level `k` = max `Hard`
    /// predecessor level + 1.
    fn levels(&self) -> Vec<Vec<TaskId>>;

    /// Longest-duration path through `Hard` edges, ties broken by higher
    /// priority then lower id.
    fn critical_path(
        &self,
        duration_of: &dyn Fn(TaskId) -> u64,
        priority_of: &dyn Fn(TaskId) -> Priority,
    ) -> CriticalPath;

    /// Diagnostics only; empty in a healthy graph.
    fn cycles(&self) -> Vec<Vec<TaskId>>;

    fn contains(&self, task_id: TaskId) -> bool;
    fn task_ids(&self) -> Vec<TaskId>;
}

/// Helper kept free of `Task` ownership: the graph never owns `Task`
/// records (spec.md §3 Ownership), it only knows ids. This stub exists so
/// call sites reading task data for scoring/critical-path go through one
/// named seam instead of ad hoc closures everywhere.
pub trait TaskLookup: Send + Sync {
    fn get(&self, task_id: TaskId) -> Option<Task>;
}
