//! Task queue daemon entry point.
//!
//! Minimal by design: there is no CLI surface beyond `run` (see
//! SPEC_FULL.md's ambient-stack notes) — operators configure the queue
//! through `config.toml`/`TASKQ__*` env vars and drive it exclusively
//! through the control API a caller embeds this binary for.

use std::sync::Arc;
use task_queue_common::ids::UuidGen;
use task_queue_common::metrics::{MetricsCollector, MetricsWindow, PrometheusMetricsCollector};
use task_queue_common::telemetry;
use task_queue_common::Config;
use task_queue_common::clock::SystemClock;
use task_queue_core::events::{Event, EventBus};
use task_queue_core::persistence::{PersistenceEngine, RestoredState};
use task_queue_core::registry::{AgentRegistry, AssignmentTable, TaskRegistry};
use task_queue_core::retry::RetryPolicy;
use task_queue_core::types::TaskOutcome;
use task_queue_persistence::FileSystemPersistenceEngine;
use task_queue_scheduler::{
    DashMapAgentRegistry, DashMapAssignmentTable, DashMapTaskRegistry, PetgraphDependencyGraph,
    Scheduler, TokioEventBus,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("config error: {error}");
        }
        std::process::exit(1);
    }

    telemetry::init_telemetry(&config.observability)?;
    task_queue_common::metrics::init_metrics()?;
    info!("starting task queue v{}", env!("CARGO_PKG_VERSION"));

    let persistence: Arc<dyn PersistenceEngine> =
        Arc::new(FileSystemPersistenceEngine::new(config.persistence.clone()));
    let restored = persistence.restore().await?;
    info!(
        tasks = restored.tasks.len(),
        edges = restored.edges.len(),
        agents = restored.agents.len(),
        assignments = restored.assignments.len(),
        "restored prior state",
    );

    let mut graph = PetgraphDependencyGraph::new();
    let tasks: Arc<dyn TaskRegistry> = Arc::new(DashMapTaskRegistry::new());
    let agents: Arc<dyn AgentRegistry> = Arc::new(DashMapAgentRegistry::new());
    let assignments: Arc<dyn AssignmentTable> = Arc::new(DashMapAssignmentTable::new());
    let events = Arc::new(TokioEventBus::new(1024));

    hydrate(&mut graph, &tasks, &agents, &assignments, restored)?;

    let metrics_window = Arc::new(MetricsWindow::default());
    spawn_metrics_listener(events.subscribe(), tasks.clone(), metrics_window.clone());

    let scheduler = Arc::new(
        Scheduler::new(
            graph,
            tasks.clone(),
            agents.clone(),
            assignments.clone(),
            events,
            Arc::new(SystemClock),
            Arc::new(UuidGen),
            RetryPolicy::default(),
            config.scheduler.clone(),
        )
        .with_persistence(persistence.clone())
        .with_metrics_window(metrics_window),
    );

    let (_handle, join) = scheduler.clone().spawn(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    join.await?;
    info!("scheduler loop stopped, persisting final snapshot");

    // The dependency graph is owned exclusively by the scheduler loop (the
    // single-writer model §5 requires) and is gone along with it here;
    // edges are not re-derived on this shutdown snapshot. A resumed queue
    // rebuilds its task/agent/assignment state faithfully but re-derives
    // readiness from `Task::dependencies` rather than persisted edges.
    let final_state = RestoredState {
        tasks: tasks.all().into_iter().map(|t| (t.id, t)).collect(),
        edges: Vec::new(),
        agents: agents.all().into_iter().map(|a| (a.id, a)).collect(),
        assignments: assignments.all().into_iter().map(|a| (a.id, a)).collect(),
    };
    if let Err(e) = persistence.snapshot(Some("shutdown".into()), &final_state).await {
        error!(error = %e, "failed to persist final snapshot");
    }

    telemetry::shutdown_telemetry();
    Ok(())
}

/// Rebuild the graph and registries from a restored snapshot, or leave
/// everything empty on a clean start.
fn hydrate(
    graph: &mut impl task_queue_core::graph::DependencyGraph,
    tasks: &Arc<dyn TaskRegistry>,
    agents: &Arc<dyn AgentRegistry>,
    assignments: &Arc<dyn AssignmentTable>,
    restored: RestoredState,
) -> anyhow::Result<()> {
    // `Task::dependencies` is the durable source of truth for `Hard` edges
    // (the only kind `submit_task` ever creates); the graph itself lives
    // inside the scheduler once constructed, so it can't be snapshotted
    // directly. `restored.edges` is reserved for non-`Hard` edge kinds a
    // future control-API command might add.
    for (task_id, _) in &restored.tasks {
        graph.add_task(*task_id)?;
    }
    for (task_id, task) in &restored.tasks {
        for dep in &task.dependencies {
            graph.add_edge(*dep, *task_id, task_queue_core::types::EdgeKind::Hard, 1.0)?;
        }
    }
    for (_, task) in restored.tasks {
        tasks.insert(task)?;
    }
    for (_, agent) in restored.agents {
        agents.register(agent)?;
    }
    for (_, assignment) in restored.assignments {
        assignments.insert(assignment);
    }
    Ok(())
}

/// Feed the prometheus-backed `MetricsCollector` and the rolling
/// `MetricsWindow` from the event bus, per the requirement that metrics
/// collection never sits on the scheduler's write path (spec.md §4.5). Runs
/// for the lifetime of the process; a lagged receiver (subscriber fell
/// behind the broadcast buffer) just resumes from wherever the channel
/// picks back up.
fn spawn_metrics_listener(
    mut events: tokio::sync::broadcast::Receiver<Event>,
    tasks: Arc<dyn TaskRegistry>,
    window: Arc<MetricsWindow>,
) {
    tokio::spawn(async move {
        let collector = PrometheusMetricsCollector;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                Event::TaskSubmitted { task_id, .. } => {
                    let priority = tasks
                        .get(task_id)
                        .map(|t| format!("{:?}", t.priority))
                        .unwrap_or_else(|| "unknown".to_string());
                    collector.record_submitted(&priority);
                    window.record_submitted();
                }
                Event::TaskAssigned { task_id, at, .. } => {
                    if let Some(task) = tasks.get(task_id) {
                        let priority = format!("{:?}", task.priority);
                        let latency = (at - task.created_at)
                            .to_std()
                            .unwrap_or(std::time::Duration::ZERO);
                        collector.record_assign_latency(&priority, latency);
                        window.record_assign_latency(latency);
                    }
                }
                Event::TaskCompleted { .. } => {
                    collector.record_completed("success");
                    window.record_completed();
                }
                Event::TaskFailed { outcome, .. } => {
                    let reason = match outcome {
                        TaskOutcome::TransientFailure { .. } => "transient_failure",
                        TaskOutcome::PermanentFailure { .. } => "permanent_failure",
                        TaskOutcome::Success => "failure",
                    };
                    collector.record_completed(reason);
                    window.record_failed();
                }
                Event::TaskDeadLettered { .. } => collector.record_completed("dead_lettered"),
                Event::AgentLost { .. } => collector.record_error("agent_lost", "warning"),
                Event::Starvation { blocked_count, .. } => {
                    collector.set_queue_depth("blocked", blocked_count as i64);
                }
                Event::TaskStarted { .. }
                | Event::TaskCancelled { .. }
                | Event::AgentRegistered { .. }
                | Event::QueueRebalanced { .. }
                | Event::StatePersisted { .. } => {}
            }
        }
    });
}
