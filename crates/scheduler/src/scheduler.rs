//! The execution controller: selects ready tasks and best-fit agents,
//! drives the per-task state machine, and runs the periodic tick/rebalance
//! loop (spec.md §4.3).
//!
//! The scheduler never executes tasks itself — it only ever hands work to
//! external workers through the control commands and waits for an ack.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use priority_queue::PriorityQueue;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use task_queue_common::config::SchedulerConfig;
use task_queue_common::error::{Error, Result};
use task_queue_common::ids::{AgentId, AssignmentId, TaskId};
use task_queue_common::metrics::MetricsWindow;
use task_queue_common::{Clock, IdGen};
use task_queue_core::control::{Command, NewTask, QueueStatusReport, Response, TaskInfoReport};
use task_queue_core::events::{Event, EventBus};
use task_queue_core::graph::DependencyGraph;
use task_queue_core::persistence::{PersistenceEngine, RestoredState};
use task_queue_core::registry::{AgentRegistry, AssignmentTable, TaskRegistry};
use task_queue_core::retry::{RetryDecision, RetryPolicy};
use task_queue_core::scoring::{self, ScoringInput};
use task_queue_core::types::{
    Agent, AgentStatus, Assignment, EdgeKind, ExecutionMetrics, Priority, Task, TaskOutcome, TaskStatus,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument};

/// One in-flight request made of a `Scheduler` through its command channel.
pub struct Request {
    pub command: Command,
    pub respond_to: oneshot::Sender<Response>,
}

/// Handle used by external callers (submission, acks, heartbeats, ...) to
/// talk to a running scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<Request>,
}

impl SchedulerHandle {
    pub async fn call(&self, command: Command) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Request {
                command,
                respond_to: tx,
            })
            .await
            .map_err(|_| Error::Internal("scheduler loop is not running".into()))?;
        rx.await
            .map_err(|_| Error::Internal("scheduler loop dropped the response channel".into()))
    }
}

/// The execution controller. Generic over the `DependencyGraph`
/// implementation so tests can swap in a fake.
pub struct Scheduler<G: DependencyGraph> {
    graph: parking_lot::Mutex<G>,
    tasks: Arc<dyn TaskRegistry>,
    agents: Arc<dyn AgentRegistry>,
    assignments: Arc<dyn AssignmentTable>,
    events: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    id_gen: Arc<dyn IdGen>,
    retry_policy: RetryPolicy,
    config: SchedulerConfig,
    retry_not_before: DashMap<TaskId, DateTime<Utc>>,
    cancel_requests: DashMap<TaskId, (String, DateTime<Utc>)>,
    persistence: Option<Arc<dyn PersistenceEngine>>,
    metrics_window: Option<Arc<MetricsWindow>>,
}

impl<G: DependencyGraph> Scheduler<G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: G,
        tasks: Arc<dyn TaskRegistry>,
        agents: Arc<dyn AgentRegistry>,
        assignments: Arc<dyn AssignmentTable>,
        events: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        id_gen: Arc<dyn IdGen>,
        retry_policy: RetryPolicy,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            graph: parking_lot::Mutex::new(graph),
            tasks,
            agents,
            assignments,
            events,
            clock,
            id_gen,
            retry_policy,
            config,
            retry_not_before: DashMap::new(),
            cancel_requests: DashMap::new(),
            persistence: None,
            metrics_window: None,
        }
    }

    /// Attach the persistence engine the `Snapshot`/`Restore` control
    /// commands drive. Without one, those commands answer with an error.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceEngine>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Attach the rolling-window metrics manager `QueueStatus`'s
    /// `perf_window` field reads from. Without one, that field is `None`.
    #[must_use]
    pub fn with_metrics_window(mut self, metrics_window: Arc<MetricsWindow>) -> Self {
        self.metrics_window = Some(metrics_window);
        self
    }

    /// Run the command loop until `shutdown` resolves, ticking on
    /// `config.tick_interval_ms` and rebalancing on
    /// `config.rebalance_interval_ms`. Returns the handle callers use.
    pub fn spawn(
        self: Arc<Self>,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> (SchedulerHandle, tokio::task::JoinHandle<()>)
    where
        G: 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Request>(self.config.command_queue_size);
        let handle = SchedulerHandle { sender: tx };

        let join = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
            let mut rebalance =
                tokio::time::interval(Duration::from_millis(self.config.rebalance_interval_ms));
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tick.tick() => {
                        self.sweep_stale_agents(self.clock.now());
                        self.sweep_expired_cancellations(self.clock.now());
                        self.advance(self.clock.now());
                    }
                    _ = rebalance.tick() => {
                        self.rebalance();
                    }
                    Some(req) = rx.recv() => {
                        let response = self.handle_command(req.command).await;
                        let _ = req.respond_to.send(response);
                    }
                }
            }
        });

        (handle, join)
    }

    async fn handle_command(&self, command: Command) -> Response {
        match command {
            Command::SubmitTask(new_task) => match self.submit_task(new_task) {
                Ok(task_id) => Response::TaskSubmitted { task_id },
                Err(e) => Response::Error { message: e.to_string() },
            },
            Command::CancelTask { task_id, reason } => match self.cancel_task(task_id, reason) {
                Ok(()) => Response::TaskCancelled { task_id },
                Err(e) => Response::Error { message: e.to_string() },
            },
            Command::RegisterAgent {
                agent_id,
                capabilities,
                capacity,
            } => match self.register_agent(agent_id, capabilities, capacity) {
                Ok(()) => Response::AgentRegistered { agent_id },
                Err(e) => Response::Error { message: e.to_string() },
            },
            Command::UpdateAgent { agent_id, status } => {
                match self.agents.update(agent_id, &|a| a.status = status) {
                    Ok(()) => Response::AgentUpdated { agent_id },
                    Err(e) => Response::Error { message: e.to_string() },
                }
            }
            Command::Heartbeat { agent_id } => {
                match self.agents.heartbeat(agent_id, self.clock.now()) {
                    Ok(()) => Response::HeartbeatAcked { agent_id },
                    Err(e) => Response::Error { message: e.to_string() },
                }
            }
            Command::AckCompletion {
                assignment_id,
                outcome,
                metrics,
            } => match self.ack_completion(assignment_id, outcome, metrics) {
                Ok((task_id, status)) => Response::CompletionAcked {
                    task_id,
                    new_status: status,
                },
                Err(e) => Response::Error { message: e.to_string() },
            },
            Command::QueueStatus => Response::QueueStatus(self.queue_status()),
            Command::TaskInfo { task_id } => Response::TaskInfo(self.task_info(task_id)),
            Command::Rebalance => {
                self.rebalance();
                Response::Rebalanced {
                    queued_count: self.tasks.list_by_status(TaskStatus::Queued).len(),
                }
            }
            Command::Snapshot { label } => match &self.persistence {
                Some(engine) => match engine.snapshot(label, &self.state_for_snapshot()).await {
                    Ok(path) => Response::Snapshotted { path },
                    Err(e) => Response::Error { message: e.to_string() },
                },
                None => Response::Error {
                    message: "no persistence engine attached to this scheduler".into(),
                },
            },
            Command::Restore => match &self.persistence {
                Some(engine) => match engine.restore().await {
                    Ok(state) => {
                        let counts = state.counts();
                        self.restore_state(state);
                        Response::Restored(counts)
                    }
                    Err(e) => Response::Error { message: e.to_string() },
                },
                None => Response::Error {
                    message: "no persistence engine attached to this scheduler".into(),
                },
            },
        }
    }

    /// Current state in the shape `PersistenceEngine::snapshot` expects.
    /// Edges are not re-derived: `Task::dependencies` is the durable source
    /// of truth for the `Hard` edges `submit_task` creates, and `Restore`
    /// rebuilds them from there.
    fn state_for_snapshot(&self) -> RestoredState {
        RestoredState {
            tasks: self.tasks.all().into_iter().map(|t| (t.id, t)).collect(),
            edges: Vec::new(),
            agents: self.agents.all().into_iter().map(|a| (a.id, a)).collect(),
            assignments: self.assignments.all().into_iter().map(|a| (a.id, a)).collect(),
        }
    }

    /// Replace all in-memory state with a restored snapshot. Callers must
    /// not race this against `advance`/`rebalance`; it is only ever invoked
    /// from the single-writer command loop.
    fn restore_state(&self, state: RestoredState) {
        self.tasks.clear();
        self.agents.clear();
        self.assignments.clear();
        {
            let mut graph = self.graph.lock();
            graph.clear();
            for (task_id, _) in &state.tasks {
                let _ = graph.add_task(*task_id);
            }
            for (task_id, task) in &state.tasks {
                for dep in &task.dependencies {
                    let _ = graph.add_edge(*dep, *task_id, EdgeKind::Hard, 1.0);
                }
            }
        }
        for (_, task) in state.tasks {
            let _ = self.tasks.insert(task);
        }
        for (_, agent) in state.agents {
            let _ = self.agents.register(agent);
        }
        for (_, assignment) in state.assignments {
            self.assignments.insert(assignment);
        }
    }

    /// Task detail for `Command::TaskInfo` (spec.md §6).
    fn task_info(&self, task_id: TaskId) -> Option<TaskInfoReport> {
        let task = self.tasks.get(task_id)?;
        let assignment = self.assignments.get_for_task(task_id);
        let queue_position = (task.status == TaskStatus::Queued)
            .then(|| self.queue_position(task_id))
            .flatten();
        Some(TaskInfoReport {
            dependencies: task.dependencies.clone(),
            task,
            assignment,
            queue_position,
        })
    }

    /// Rank of `task_id` among all `Queued` tasks, ordered the same way
    /// `advance()` ranks them for assignment (ignoring readiness gating,
    /// since blocked tasks still hold a place in line).
    fn queue_position(&self, task_id: TaskId) -> Option<usize> {
        let now = self.clock.now();
        let graph = self.graph.lock();
        let mut ranked: Vec<(TaskId, RankKey)> = self
            .tasks
            .list_by_status(TaskStatus::Queued)
            .into_iter()
            .map(|t| {
                let successor_count = graph.successors(t.id).len();
                let score = scoring::score(&ScoringInput {
                    priority: t.priority,
                    created_at: t.created_at,
                    deadline: t.scheduling.deadline,
                    successor_count,
                    resource_demand: t.constraints.resource_demand,
                    attempts: t.attempts,
                    now,
                });
                (
                    t.id,
                    RankKey {
                        priority: t.priority,
                        score,
                        created_at: t.created_at,
                    },
                )
            })
            .collect();
        drop(graph);
        ranked.sort_by(|(_, a), (_, b)| b.cmp(a));
        ranked.iter().position(|(id, _)| *id == task_id)
    }

    #[instrument(skip(self, new_task))]
    pub fn submit_task(&self, new_task: NewTask) -> Result<TaskId> {
        for dep in &new_task.dependencies {
            if !self.tasks.contains(*dep) {
                return Err(Error::UnknownId(dep.to_string()));
            }
        }
        if new_task.scheduling.max_retries > 1000 {
            return Err(Error::InvalidConstraint("max_retries out of range".into()));
        }

        let now = self.clock.now();
        let task_id = self.id_gen.task_id();
        let task = Task {
            id: task_id,
            title: new_task.title,
            description: new_task.description,
            kind: new_task.kind,
            priority: new_task.priority,
            executor: new_task.executor,
            dependencies: new_task.dependencies.clone(),
            constraints: new_task.constraints,
            scheduling: new_task.scheduling,
            estimated_duration: Duration::from_millis(new_task.estimated_duration_ms),
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: now,
            last_transition_at: now,
            tags: new_task.tags,
        };

        {
            let mut graph = self.graph.lock();
            graph.add_task(task_id)?;
            for dep in &new_task.dependencies {
                if let Err(e) = graph.add_edge(*dep, task_id, EdgeKind::Hard, 1.0) {
                    graph.remove_task(task_id).ok();
                    return Err(e);
                }
            }
        }

        self.tasks.insert(task)?;
        self.tasks.transition(task_id, TaskStatus::Queued, now)?;
        self.events.publish(Event::TaskSubmitted { task_id, at: now });
        Ok(task_id)
    }

    pub fn cancel_task(&self, task_id: TaskId, reason: String) -> Result<()> {
        let Some(task) = self.tasks.get(task_id) else {
            return Err(Error::UnknownId(task_id.to_string()));
        };
        let now = self.clock.now();
        match task.status {
            TaskStatus::Cancelled => Ok(()),
            TaskStatus::Pending | TaskStatus::Queued => {
                self.tasks.transition(task_id, TaskStatus::Cancelled, now)?;
                self.events.publish(Event::TaskCancelled {
                    task_id,
                    reason,
                    at: now,
                });
                self.propagate_terminal_failure(task_id);
                Ok(())
            }
            TaskStatus::Assigned | TaskStatus::Running => {
                self.cancel_requests
                    .insert(task_id, (reason, now + ChronoDuration::milliseconds(self.config.abort_grace_ms as i64)));
                Ok(())
            }
            _ => Err(Error::WrongState(format!(
                "task {task_id} cannot be cancelled from {:?}",
                task.status
            ))),
        }
    }

    fn sweep_expired_cancellations(&self, now: DateTime<Utc>) {
        let expired: Vec<TaskId> = self
            .cancel_requests
            .iter()
            .filter(|e| e.value().1 <= now)
            .map(|e| *e.key())
            .collect();
        for task_id in expired {
            let Some((_, (reason, _))) = self.cancel_requests.remove(&task_id) else {
                continue;
            };
            self.release_assignment(task_id);
            if self.tasks.transition(task_id, TaskStatus::Cancelled, now).is_ok() {
                self.events.publish(Event::TaskCancelled { task_id, reason, at: now });
                self.propagate_terminal_failure(task_id);
            }
        }
    }

    pub fn register_agent(
        &self,
        agent_id: AgentId,
        capabilities: HashSet<String>,
        capacity: task_queue_core::types::AgentCapacity,
    ) -> Result<()> {
        if self.agents.contains(agent_id) {
            return Err(Error::DuplicateId(agent_id.to_string()));
        }
        let now = self.clock.now();
        self.agents.register(Agent {
            id: agent_id,
            capabilities,
            capacity,
            load: task_queue_core::types::AgentLoad::default(),
            status: AgentStatus::Available,
            performance: task_queue_core::types::AgentPerformance::default(),
            last_heartbeat_at: now,
        })?;
        self.events.publish(Event::AgentRegistered { agent_id, at: now });
        Ok(())
    }

    #[instrument(skip(self, metrics))]
    pub fn ack_completion(
        &self,
        assignment_id: AssignmentId,
        outcome: TaskOutcome,
        metrics: ExecutionMetrics,
    ) -> Result<(TaskId, TaskStatus)> {
        let assignment = self
            .assignments
            .get(assignment_id)
            .ok_or_else(|| Error::UnknownId(assignment_id.to_string()))?;
        let task_id = assignment.task_id;
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::UnknownId(task_id.to_string()))?;
        if !matches!(task.status, TaskStatus::Running | TaskStatus::Assigned) {
            return Err(Error::WrongState(format!(
                "task {task_id} is not awaiting completion (status {:?})",
                task.status
            )));
        }

        let now = self.clock.now();
        self.release_assignment(task_id);
        self.update_agent_performance(assignment.agent_id, metrics.duration, &outcome);

        let new_status = match outcome {
            TaskOutcome::Success => {
                self.tasks.transition(task_id, TaskStatus::Completed, now)?;
                self.events.publish(Event::TaskCompleted { task_id, at: now });
                TaskStatus::Completed
            }
            TaskOutcome::PermanentFailure { .. } => {
                self.tasks.transition(task_id, TaskStatus::DeadLettered, now)?;
                self.events.publish(Event::TaskFailed {
                    task_id,
                    outcome: outcome.clone(),
                    at: now,
                });
                self.events.publish(Event::TaskDeadLettered { task_id, at: now });
                self.propagate_terminal_failure(task_id);
                TaskStatus::DeadLettered
            }
            TaskOutcome::TransientFailure { .. } => {
                self.tasks.transition(task_id, TaskStatus::Failed, now)?;
                self.events.publish(Event::TaskFailed {
                    task_id,
                    outcome: outcome.clone(),
                    at: now,
                });
                self.apply_retry_decision(task_id, now)?
            }
        };

        Ok((task_id, new_status))
    }

    fn apply_retry_decision(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<TaskStatus> {
        let mut task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::UnknownId(task_id.to_string()))?;
        task.attempts += 1;
        match self.retry_policy.decide(task.attempts) {
            RetryDecision::Retry { backoff } => {
                self.retry_not_before.insert(task_id, now + to_chrono(backoff));
                self.tasks.transition(task_id, TaskStatus::Queued, now)?;
                self.bump_attempts(task_id, task.attempts)?;
                Ok(TaskStatus::Queued)
            }
            RetryDecision::DeadLetter => {
                self.tasks.transition(task_id, TaskStatus::DeadLettered, now)?;
                self.bump_attempts(task_id, task.attempts)?;
                self.events.publish(Event::TaskDeadLettered { task_id, at: now });
                self.propagate_terminal_failure(task_id);
                Ok(TaskStatus::DeadLettered)
            }
        }
    }

    fn bump_attempts(&self, task_id: TaskId, attempts: u32) -> Result<()> {
        self.tasks.set_attempts(task_id, attempts)
    }

    fn release_assignment(&self, task_id: TaskId) {
        let Some(assignment) = self.assignments.remove_for_task(task_id) else {
            return;
        };
        let demand = self
            .tasks
            .get(task_id)
            .map(|t| t.constraints.resource_demand)
            .unwrap_or_default();
        let _ = self.agents.update(assignment.agent_id, &|agent| {
            agent.load.current_concurrent = agent.load.current_concurrent.saturating_sub(1);
            agent.load.cpu_in_use = (agent.load.cpu_in_use - demand.cpu).max(0.0);
            agent.load.memory_in_use = (agent.load.memory_in_use - demand.memory_mb).max(0.0);
            agent.load.disk_in_use = (agent.load.disk_in_use - demand.disk_mb).max(0.0);
        });
    }

    fn update_agent_performance(&self, agent_id: AgentId, duration: Duration, outcome: &TaskOutcome) {
        let success = matches!(outcome, TaskOutcome::Success);
        let duration_ms = duration.as_millis() as f64;
        let _ = self.agents.update(agent_id, &|agent| {
            agent.performance.record(duration_ms, success);
        });
    }

    /// Any task whose `Hard` predecessor just became terminally negative
    /// dead-letters directly: retrying cannot fix a missing dependency.
    fn propagate_terminal_failure(&self, task_id: TaskId) {
        let graph = self.graph.lock();
        let mut frontier = vec![task_id];
        while let Some(current) = frontier.pop() {
            for edge in graph.successors(current) {
                if !edge.kind.is_gating() {
                    continue;
                }
                let Some(dependent) = self.tasks.get(edge.to) else {
                    continue;
                };
                if matches!(dependent.status, TaskStatus::Pending | TaskStatus::Queued) {
                    let now = self.clock.now();
                    if self
                        .tasks
                        .transition(edge.to, TaskStatus::DeadLettered, now)
                        .is_ok()
                    {
                        self.events
                            .publish(Event::TaskDeadLettered { task_id: edge.to, at: now });
                        frontier.push(edge.to);
                    }
                }
            }
        }
    }

    fn sweep_stale_agents(&self, now: DateTime<Utc>) {
        let timeout = ChronoDuration::milliseconds(self.config.agent_heartbeat_timeout_ms as i64);
        for agent_id in self.agents.stale(now, timeout) {
            let running_tasks: Vec<TaskId> = self
                .assignments
                .all()
                .into_iter()
                .filter(|a| a.agent_id == agent_id)
                .map(|a| a.task_id)
                .collect();

            for task_id in running_tasks {
                self.release_assignment(task_id);
                if self.tasks.transition(task_id, TaskStatus::Queued, now).is_ok() {
                    debug!(%task_id, %agent_id, "assignment released after agent loss");
                }
            }

            let _ = self
                .agents
                .update(agent_id, &|agent| agent.status = AgentStatus::Offline);
            self.events.publish(Event::AgentLost { agent_id, at: now });
        }
    }

    /// One scheduler tick (spec.md §4.3 step 1-4).
    #[instrument(skip(self))]
    pub fn advance(&self, now: DateTime<Utc>) -> usize {
        let graph = self.graph.lock();
        let queued = self.tasks.list_by_status(TaskStatus::Queued);

        let ready: Vec<Task> = queued
            .into_iter()
            .filter(|t| {
                self.retry_not_before
                    .get(&t.id)
                    .map_or(true, |not_before| now >= *not_before)
            })
            .filter(|t| graph.is_ready(t.id, &|id| self.tasks.get(id).map(|t| t.status)))
            .collect();

        if ready.is_empty() {
            let still_queued = self.tasks.list_by_status(TaskStatus::Queued).len();
            if still_queued > 0 {
                self.events.publish(Event::Starvation {
                    blocked_count: still_queued,
                    at: now,
                });
            }
            return 0;
        }

        let mut queue: PriorityQueue<TaskId, RankKey> = PriorityQueue::with_capacity(ready.len());
        let mut by_id: std::collections::HashMap<TaskId, Task> = std::collections::HashMap::with_capacity(ready.len());
        for t in ready {
            let successor_count = graph.successors(t.id).len();
            let score = scoring::score(&ScoringInput {
                priority: t.priority,
                created_at: t.created_at,
                deadline: t.scheduling.deadline,
                successor_count,
                resource_demand: t.constraints.resource_demand,
                attempts: t.attempts,
                now,
            });
            queue.push(
                t.id,
                RankKey {
                    priority: t.priority,
                    score,
                    created_at: t.created_at,
                },
            );
            by_id.insert(t.id, t);
        }
        drop(graph);

        let mut assigned_count = 0;
        while let Some((task_id, _)) = queue.pop() {
            let Some(task) = by_id.get(&task_id) else {
                continue;
            };
            let Some(agent) = self.pick_agent(task) else {
                continue;
            };
            self.assign(task, &agent, now);
            assigned_count += 1;
        }
        assigned_count
    }

    fn pick_agent(&self, task: &Task) -> Option<Agent> {
        let candidates: Vec<Agent> = self
            .agents
            .all()
            .into_iter()
            .filter(|a| a.status == AgentStatus::Available)
            .filter(|a| a.has_free_capacity())
            .filter(|a| a.has_capabilities(&task.constraints.required_capabilities))
            .filter(|a| a.has_resource_headroom(&task.constraints.resource_demand))
            .filter(|a| {
                task.constraints
                    .required_agent
                    .map_or(true, |required| required == a.id)
            })
            .collect();

        candidates
            .into_iter()
            .max_by(|a, b| agent_fit_score(a, task).total_cmp(&agent_fit_score(b, task)))
    }

    fn assign(&self, task: &Task, agent: &Agent, now: DateTime<Utc>) {
        let assignment_id = self.id_gen.assignment_id();
        let assignment = Assignment {
            id: assignment_id,
            task_id: task.id,
            agent_id: agent.id,
            assigned_at: now,
            started_at: None,
            estimated_completion_at: now + to_chrono(task.estimated_duration),
            attempt: task.attempts + 1,
        };
        self.assignments.insert(assignment);
        let _ = self.agents.update(agent.id, &|a| {
            a.load.current_concurrent += 1;
            a.load.cpu_in_use += task.constraints.resource_demand.cpu;
            a.load.memory_in_use += task.constraints.resource_demand.memory_mb;
            a.load.disk_in_use += task.constraints.resource_demand.disk_mb;
        });
        if self.tasks.transition(task.id, TaskStatus::Assigned, now).is_ok() {
            self.events.publish(Event::TaskAssigned {
                task_id: task.id,
                agent_id: agent.id,
                assignment_id,
                at: now,
            });
        }
    }

    /// Rescan all `Queued` tasks and re-sort; never touches
    /// `Assigned`/`Running` tasks.
    pub fn rebalance(&self) {
        let now = self.clock.now();
        info!("rebalancing queue");
        let queued_count = self.tasks.list_by_status(TaskStatus::Queued).len();
        self.events.publish(Event::QueueRebalanced { queued_count, at: now });
    }

    pub fn queue_status(&self) -> QueueStatusReport {
        let mut report = QueueStatusReport::from_tasks_and_agents(&self.tasks.all(), &self.agents.all());
        report.next_task = self.next_ready_task();
        report.perf_window = self.metrics_window.as_ref().map(|w| w.snapshot());
        report
    }

    /// Highest-ranked `Queued` task that is actually ready to run, i.e. the
    /// one `advance()` would assign first if an agent has headroom for it.
    fn next_ready_task(&self) -> Option<TaskId> {
        let now = self.clock.now();
        let graph = self.graph.lock();
        self.tasks
            .list_by_status(TaskStatus::Queued)
            .into_iter()
            .filter(|t| {
                self.retry_not_before
                    .get(&t.id)
                    .map_or(true, |not_before| now >= *not_before)
            })
            .filter(|t| graph.is_ready(t.id, &|id| self.tasks.get(id).map(|t| t.status)))
            .map(|t| {
                let successor_count = graph.successors(t.id).len();
                let score = scoring::score(&ScoringInput {
                    priority: t.priority,
                    created_at: t.created_at,
                    deadline: t.scheduling.deadline,
                    successor_count,
                    resource_demand: t.constraints.resource_demand,
                    attempts: t.attempts,
                    now,
                });
                (
                    t.id,
                    RankKey {
                        priority: t.priority,
                        score,
                        created_at: t.created_at,
                    },
                )
            })
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(id, _)| id)
    }
}

/// Ordering key for the ready-task priority queue: priority first, then
/// `PriorityScorer` score, then earlier `created_at` breaks ties.
#[derive(Debug, Clone, Copy)]
struct RankKey {
    priority: Priority,
    score: f64,
    created_at: DateTime<Utc>,
}

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankKey {}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.score.partial_cmp(&other.score).unwrap_or(Ordering::Equal))
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

/// Agent-fit score for the assignment step (spec.md §4.3 step 3c):
/// `successRate + loadFactor*50 + speedBonus + resourceAvailability*20 +
/// capabilityMatchBonus`.
fn agent_fit_score(agent: &Agent, task: &Task) -> f64 {
    let load_factor = if agent.capacity.max_concurrent == 0 {
        0.0
    } else {
        1.0 - f64::from(agent.load.current_concurrent) / f64::from(agent.capacity.max_concurrent)
    };
    let speed_bonus = 10.0 / (1.0 + agent.performance.avg_completion_ms / 1000.0);
    let resource_availability = resource_headroom_fraction(agent);
    let capability_match_bonus = if agent.capabilities.is_empty() {
        0.0
    } else {
        5.0 * task.constraints.required_capabilities.len() as f64 / agent.capabilities.len() as f64
    };

    agent.performance.success_rate + load_factor * 50.0 + speed_bonus + resource_availability * 20.0
        + capability_match_bonus
}

fn resource_headroom_fraction(agent: &Agent) -> f64 {
    let cpu_frac = headroom(agent.capacity.cpu, agent.load.cpu_in_use);
    let mem_frac = headroom(agent.capacity.memory_mb, agent.load.memory_in_use);
    let disk_frac = headroom(agent.capacity.disk_mb, agent.load.disk_in_use);
    (cpu_frac + mem_frac + disk_frac) / 3.0
}

fn headroom(capacity: f64, in_use: f64) -> f64 {
    if capacity <= 0.0 {
        0.0
    } else {
        ((capacity - in_use) / capacity).clamp(0.0, 1.0)
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::PetgraphDependencyGraph;
    use crate::events::TokioEventBus;
    use crate::registry::{DashMapAgentRegistry, DashMapAssignmentTable, DashMapTaskRegistry};
    use task_queue_common::clock::TestClock;
    use task_queue_common::ids::UuidGen;
    use task_queue_core::types::{AgentCapacity, Constraints, ExecutorHandle, SchedulingHints};

    fn make_scheduler() -> Scheduler<PetgraphDependencyGraph> {
        Scheduler::new(
            PetgraphDependencyGraph::new(),
            Arc::new(DashMapTaskRegistry::new()),
            Arc::new(DashMapAgentRegistry::new()),
            Arc::new(DashMapAssignmentTable::new()),
            Arc::new(TokioEventBus::new(256)),
            Arc::new(TestClock::new(Utc::now())),
            Arc::new(UuidGen),
            RetryPolicy::default(),
            SchedulerConfig::default(),
        )
    }

    fn new_task(priority: Priority, deps: HashSet<TaskId>) -> NewTask {
        NewTask {
            title: "t".into(),
            description: String::new(),
            kind: "noop".into(),
            priority,
            executor: ExecutorHandle {
                name: "noop".into(),
                parameters: serde_json::Value::Null,
            },
            dependencies: deps,
            constraints: Constraints::default(),
            scheduling: SchedulingHints::default(),
            estimated_duration_ms: 100,
            tags: HashSet::new(),
        }
    }

    #[test]
    fn linear_chain_assigns_in_dependency_order() {
        let scheduler = make_scheduler();
        let t1 = scheduler.submit_task(new_task(Priority::Normal, HashSet::new())).unwrap();
        let mut deps = HashSet::new();
        deps.insert(t1);
        let t2 = scheduler.submit_task(new_task(Priority::Normal, deps)).unwrap();

        scheduler
            .register_agent(
                AgentId::new(),
                HashSet::new(),
                AgentCapacity {
                    cpu: 10.0,
                    memory_mb: 10_000.0,
                    disk_mb: 10_000.0,
                    max_concurrent: 1,
                },
            )
            .unwrap();

        let now = Utc::now();
        scheduler.advance(now);
        assert_eq!(scheduler.tasks.get(t1).unwrap().status, TaskStatus::Assigned);
        assert_eq!(scheduler.tasks.get(t2).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn critical_outranks_normal_when_capacity_is_scarce() {
        let scheduler = make_scheduler();
        let low = scheduler.submit_task(new_task(Priority::Low, HashSet::new())).unwrap();
        let critical = scheduler
            .submit_task(new_task(Priority::Critical, HashSet::new()))
            .unwrap();

        scheduler
            .register_agent(
                AgentId::new(),
                HashSet::new(),
                AgentCapacity {
                    cpu: 10.0,
                    memory_mb: 10_000.0,
                    disk_mb: 10_000.0,
                    max_concurrent: 1,
                },
            )
            .unwrap();

        scheduler.advance(Utc::now());
        assert_eq!(scheduler.tasks.get(critical).unwrap().status, TaskStatus::Assigned);
        assert_eq!(scheduler.tasks.get(low).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn retry_then_dead_letter_after_max_attempts() {
        let scheduler = Scheduler::new(
            PetgraphDependencyGraph::new(),
            Arc::new(DashMapTaskRegistry::new()),
            Arc::new(DashMapAgentRegistry::new()),
            Arc::new(DashMapAssignmentTable::new()),
            Arc::new(TokioEventBus::new(256)),
            Arc::new(TestClock::new(Utc::now())),
            Arc::new(UuidGen),
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(10),
            },
            SchedulerConfig::default(),
        );
        let task_id = scheduler.submit_task(new_task(Priority::Normal, HashSet::new())).unwrap();
        scheduler
            .register_agent(
                AgentId::new(),
                HashSet::new(),
                AgentCapacity {
                    cpu: 10.0,
                    memory_mb: 10_000.0,
                    disk_mb: 10_000.0,
                    max_concurrent: 1,
                },
            )
            .unwrap();

        for _ in 0..3 {
            scheduler.advance(Utc::now());
            let assignment = scheduler
                .assignments
                .get_for_task(task_id)
                .expect("task should have been assigned");
            scheduler
                .ack_completion(
                    assignment.id,
                    TaskOutcome::TransientFailure { reason: "boom".into() },
                    ExecutionMetrics::default(),
                )
                .unwrap();
        }

        assert_eq!(scheduler.tasks.get(task_id).unwrap().status, TaskStatus::DeadLettered);
        assert_eq!(scheduler.tasks.get(task_id).unwrap().attempts, 3);
    }

    #[test]
    fn cancel_on_queued_task_is_immediate_and_idempotent() {
        let scheduler = make_scheduler();
        let task_id = scheduler.submit_task(new_task(Priority::Normal, HashSet::new())).unwrap();
        scheduler.cancel_task(task_id, "user".into()).unwrap();
        scheduler.cancel_task(task_id, "user".into()).unwrap();
        assert_eq!(scheduler.tasks.get(task_id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn agent_loss_requeues_its_running_task() {
        let start = Utc::now();
        let clock = Arc::new(TestClock::new(start));
        let scheduler = Scheduler::new(
            PetgraphDependencyGraph::new(),
            Arc::new(DashMapTaskRegistry::new()),
            Arc::new(DashMapAgentRegistry::new()),
            Arc::new(DashMapAssignmentTable::new()),
            Arc::new(TokioEventBus::new(256)),
            clock.clone(),
            Arc::new(UuidGen),
            RetryPolicy::default(),
            SchedulerConfig {
                agent_heartbeat_timeout_ms: 1_000,
                ..SchedulerConfig::default()
            },
        );
        let task_id = scheduler.submit_task(new_task(Priority::Normal, HashSet::new())).unwrap();
        let agent_id = AgentId::new();
        scheduler
            .register_agent(
                agent_id,
                HashSet::new(),
                AgentCapacity {
                    cpu: 10.0,
                    memory_mb: 10_000.0,
                    disk_mb: 10_000.0,
                    max_concurrent: 1,
                },
            )
            .unwrap();

        scheduler.advance(clock.now());
        assert_eq!(scheduler.tasks.get(task_id).unwrap().status, TaskStatus::Assigned);

        clock.advance(2_000);
        scheduler.sweep_stale_agents(clock.now());

        assert_eq!(scheduler.tasks.get(task_id).unwrap().status, TaskStatus::Queued);
        assert!(scheduler.assignments.get_for_task(task_id).is_none());
        assert_eq!(scheduler.agents.get(agent_id).unwrap().status, AgentStatus::Offline);
    }
}
