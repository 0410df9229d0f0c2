//! On-disk envelope wrapping a snapshot, and the small metadata record kept
//! alongside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use task_queue_common::ids::SnapshotId;
use task_queue_core::persistence::RestoredState;

/// Bumped whenever the envelope's shape changes in a way old readers can't
/// parse. `restore` refuses anything newer than this crate understands.
pub const SCHEMA_VERSION: u32 = 1;

/// The structural record written to `queue-state.json` (before the
/// compression/encryption layers are applied on top).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub schema_version: u32,
    pub snapshot_id: SnapshotId,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: RestoredState,
}

impl SnapshotEnvelope {
    #[must_use]
    pub fn new(snapshot_id: SnapshotId, label: Option<String>, created_at: DateTime<Utc>, state: RestoredState) -> Self {
        Self { schema_version: SCHEMA_VERSION, snapshot_id, label, created_at, state }
    }
}

/// Small sidecar file (`persistence-metadata.json`) tracking the last
/// successful write, independent of the snapshot payload itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceMetadata {
    pub last_snapshot_id: Option<SnapshotId>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub last_snapshot_path: Option<PathBuf>,
    pub backup_count: usize,
    pub size: u64,
    pub checksum: String,
}
