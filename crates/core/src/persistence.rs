//! `PersistenceEngine` contract (spec.md §4.4, §6).

use crate::types::{Agent, Assignment, DependencyEdge, OrderedMap, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use task_queue_common::error::Result;
use task_queue_common::ids::{AgentId, AssignmentId, TaskId};

/// Health of the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealth {
    pub writable: bool,
    pub primary_valid: bool,
    pub backup_count: usize,
    pub last_sync_age_ms: Option<u64>,
    pub disk_usage_bytes: u64,
}

/// Outcome of a successful restore: the materialized tables plus the
/// counts the control API reports (spec.md §6 `Restore` → counts).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoredState {
    pub tasks: OrderedMap<TaskId, Task>,
    pub edges: Vec<DependencyEdge>,
    pub agents: OrderedMap<AgentId, Agent>,
    pub assignments: OrderedMap<AssignmentId, Assignment>,
}

/// Point-in-time counts, independent of whether anything was actually
/// restored (a clean start reports all-zero counts).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RestoreCounts {
    pub tasks: usize,
    pub edges: usize,
    pub agents: usize,
    pub assignments: usize,
}

impl RestoredState {
    #[must_use]
    pub fn counts(&self) -> RestoreCounts {
        RestoreCounts {
            tasks: self.tasks.len(),
            edges: self.edges.len(),
            agents: self.agents.len(),
            assignments: self.assignments.len(),
        }
    }
}

/// Crash-safe snapshotting of full scheduler state.
#[async_trait]
pub trait PersistenceEngine: Send + Sync {
    /// Write a new snapshot following the 8-step atomic write protocol,
    /// returning the path written.
    async fn snapshot(
        &self,
        label: Option<String>,
        state: &RestoredState,
    ) -> Result<PathBuf>;

    /// Restore from the ordered fallback chain (primary, secondary backup,
    /// versioned backups newest-first, else clean start).
    async fn restore(&self) -> Result<RestoredState>;

    async fn health_check(&self) -> Result<StorageHealth>;
}
