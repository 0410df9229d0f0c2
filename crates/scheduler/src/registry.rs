//! `dashmap`-backed implementations of the core registry traits.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use task_queue_common::error::{Error, Result};
use task_queue_common::ids::{AgentId, AssignmentId, TaskId};
use task_queue_core::registry::{AgentRegistry, AssignmentTable, TaskRegistry};
use task_queue_core::types::{Agent, Assignment, Task, TaskStatus};

/// Concurrent `TaskRegistry`. One entry per task, keyed by id.
#[derive(Default)]
pub struct DashMapTaskRegistry {
    tasks: DashMap<TaskId, Task>,
}

impl DashMapTaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskRegistry for DashMapTaskRegistry {
    fn insert(&self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::DuplicateId(task.id.to_string()));
        }
        self.tasks.insert(task.id, task);
        Ok(())
    }

    fn get(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.get(&task_id).map(|t| t.clone())
    }

    fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    fn remove(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.remove(&task_id).map(|(_, t)| t)
    }

    fn transition(&self, task_id: TaskId, status: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::UnknownId(task_id.to_string()))?;
        entry.status = status;
        entry.last_transition_at = now;
        Ok(())
    }

    fn set_attempts(&self, task_id: TaskId, attempts: u32) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::UnknownId(task_id.to_string()))?;
        entry.attempts = attempts;
        Ok(())
    }

    fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.clone())
            .collect()
    }

    fn all(&self) -> Vec<Task> {
        self.tasks.iter().map(|e| e.clone()).collect()
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn clear(&self) {
        self.tasks.clear();
    }
}

/// Concurrent `AgentRegistry`.
#[derive(Default)]
pub struct DashMapAgentRegistry {
    agents: DashMap<AgentId, Agent>,
}

impl DashMapAgentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentRegistry for DashMapAgentRegistry {
    fn register(&self, agent: Agent) -> Result<()> {
        self.agents.insert(agent.id, agent);
        Ok(())
    }

    fn get(&self, agent_id: AgentId) -> Option<Agent> {
        self.agents.get(&agent_id).map(|a| a.clone())
    }

    fn contains(&self, agent_id: AgentId) -> bool {
        self.agents.contains_key(&agent_id)
    }

    fn update(&self, agent_id: AgentId, f: &dyn Fn(&mut Agent)) -> Result<()> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| Error::UnknownId(agent_id.to_string()))?;
        f(&mut entry);
        Ok(())
    }

    fn all(&self) -> Vec<Agent> {
        self.agents.iter().map(|e| e.clone()).collect()
    }

    fn heartbeat(&self, agent_id: AgentId, at: DateTime<Utc>) -> Result<()> {
        self.update(agent_id, &|agent| agent.last_heartbeat_at = at)
    }

    fn stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|e| now - e.last_heartbeat_at > timeout)
            .map(|e| e.id)
            .collect()
    }

    fn clear(&self) {
        self.agents.clear();
    }
}

/// Concurrent `AssignmentTable`, indexed by both assignment id and task id.
#[derive(Default)]
pub struct DashMapAssignmentTable {
    by_id: DashMap<AssignmentId, Assignment>,
    by_task: DashMap<TaskId, AssignmentId>,
}

impl DashMapAssignmentTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignmentTable for DashMapAssignmentTable {
    fn get(&self, assignment_id: AssignmentId) -> Option<Assignment> {
        self.by_id.get(&assignment_id).map(|a| a.clone())
    }

    fn insert(&self, assignment: Assignment) {
        self.by_task.insert(assignment.task_id, assignment.id);
        self.by_id.insert(assignment.id, assignment);
    }

    fn get_for_task(&self, task_id: TaskId) -> Option<Assignment> {
        let assignment_id = *self.by_task.get(&task_id)?;
        self.by_id.get(&assignment_id).map(|a| a.clone())
    }

    fn remove_for_task(&self, task_id: TaskId) -> Option<Assignment> {
        let (_, assignment_id) = self.by_task.remove(&task_id)?;
        self.by_id.remove(&assignment_id).map(|(_, a)| a)
    }

    fn remove(&self, assignment_id: AssignmentId) -> Option<Assignment> {
        let (_, assignment) = self.by_id.remove(&assignment_id)?;
        self.by_task.remove(&assignment.task_id);
        Some(assignment)
    }

    fn all(&self) -> Vec<Assignment> {
        self.by_id.iter().map(|e| e.clone()).collect()
    }

    fn count_for_agent(&self, agent_id: AgentId) -> usize {
        self.by_id.iter().filter(|e| e.agent_id == agent_id).count()
    }

    fn clear(&self) {
        self.by_id.clear();
        self.by_task.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_queue_common::ids::UuidGen;
    use task_queue_common::IdGen;
    use task_queue_core::types::{
        AgentCapacity, AgentLoad, AgentPerformance, AgentStatus, Constraints, ExecutorHandle,
        Priority, SchedulingHints,
    };
    use std::collections::HashSet;

    fn sample_task() -> Task {
        let gen = UuidGen;
        let now = Utc::now();
        Task {
            id: gen.task_id(),
            title: "t".into(),
            description: String::new(),
            kind: "noop".into(),
            priority: Priority::Normal,
            executor: ExecutorHandle {
                name: "noop".into(),
                parameters: serde_json::Value::Null,
            },
            dependencies: HashSet::new(),
            constraints: Constraints::default(),
            scheduling: SchedulingHints::default(),
            estimated_duration: std::time::Duration::from_secs(1),
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: now,
            last_transition_at: now,
            tags: HashSet::new(),
        }
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let registry = DashMapTaskRegistry::new();
        let task = sample_task();
        registry.insert(task.clone()).unwrap();
        assert!(matches!(registry.insert(task), Err(Error::DuplicateId(_))));
    }

    #[test]
    fn transition_updates_status_and_timestamp() {
        let registry = DashMapTaskRegistry::new();
        let task = sample_task();
        let id = task.id;
        registry.insert(task).unwrap();
        let later = Utc::now() + Duration::seconds(5);
        registry.transition(id, TaskStatus::Queued, later).unwrap();
        let updated = registry.get(id).unwrap();
        assert_eq!(updated.status, TaskStatus::Queued);
        assert_eq!(updated.last_transition_at, later);
    }

    #[test]
    fn stale_agents_detected_past_timeout() {
        let registry = DashMapAgentRegistry::new();
        let gen = UuidGen;
        let agent = Agent {
            id: gen.agent_id(),
            capabilities: HashSet::new(),
            capacity: AgentCapacity::default(),
            load: AgentLoad::default(),
            status: AgentStatus::Available,
            performance: AgentPerformance::default(),
            last_heartbeat_at: Utc::now() - Duration::minutes(10),
        };
        let id = agent.id;
        registry.register(agent).unwrap();
        let stale = registry.stale(Utc::now(), Duration::minutes(5));
        assert_eq!(stale, vec![id]);
    }
}
