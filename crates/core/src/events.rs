//! Closed set of lifecycle events (spec.md §2, §9).
//!
//! The source broadcasts many event types through a string-keyed bus; per
//! the design notes this rewrite uses one tagged-union `Event` enum instead,
//! so subscribers pattern-match instead of string-matching.

use crate::types::{CancelReason, TaskOutcome};
use serde::{Deserialize, Serialize};
use task_queue_common::ids::{AgentId, AssignmentId, TaskId};
use task_queue_common::DateTime;
use task_queue_common::Utc;

/// A single lifecycle event. Event emission is causally ordered with state
/// transitions: the transition commits first, then the event is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    TaskSubmitted {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        assignment_id: AssignmentId,
        at: DateTime<Utc>,
    },
    TaskStarted {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: TaskId,
        outcome: TaskOutcome,
        at: DateTime<Utc>,
    },
    TaskDeadLettered {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: CancelReason,
        at: DateTime<Utc>,
    },
    AgentRegistered {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    AgentLost {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    QueueRebalanced {
        queued_count: usize,
        at: DateTime<Utc>,
    },
    StatePersisted {
        snapshot_path: String,
        at: DateTime<Utc>,
    },
    Starvation {
        blocked_count: usize,
        at: DateTime<Utc>,
    },
}

/// In-process pub/sub for lifecycle events. Subscribers register a typed
/// handler per event (here: receive the closed `Event` enum and match on
/// it) rather than keying off a string type name.
pub trait EventBus: Send + Sync {
    /// Publish an event to all current subscribers. Must not block the
    /// caller on a slow subscriber — a bounded/broadcast implementation is
    /// expected to drop or buffer, never synchronously wait.
    fn publish(&self, event: Event);

    /// Subscribe to the event stream; each subscriber gets every event from
    /// the point of subscription onward.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event>;
}
