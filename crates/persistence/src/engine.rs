//! Filesystem-backed `PersistenceEngine`: the 8-step atomic write protocol,
//! the ordered recovery fallback chain, backup retention, and health
//! reporting (spec.md §4.4).

use crate::compression;
use crate::encryption;
use crate::format::{PersistenceMetadata, SnapshotEnvelope, SCHEMA_VERSION};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};
use task_queue_common::config::PersistenceConfig;
use task_queue_common::error::{Error, Result};
use task_queue_common::ids::SnapshotId;
use task_queue_core::persistence::{PersistenceEngine, RestoredState, StorageHealth};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

/// Structural + cross-reference validation (I7's round-trip check, and the
/// write protocol's step-4 re-read validation).
fn validate_state(state: &RestoredState) -> Result<()> {
    let task_ids: HashSet<_> = state.tasks.iter().map(|(id, _)| *id).collect();
    for (_, assignment) in &state.assignments {
        if !task_ids.contains(&assignment.task_id) {
            return Err(Error::Corrupt(format!(
                "assignment {} references unknown task {}",
                assignment.id, assignment.task_id
            )));
        }
    }
    for edge in &state.edges {
        if !task_ids.contains(&edge.from) || !task_ids.contains(&edge.to) {
            return Err(Error::Corrupt(format!(
                "edge {} references a task outside the snapshot",
                edge.id
            )));
        }
    }
    Ok(())
}

/// Snapshots to, and restores from, a directory on the local filesystem.
pub struct FileSystemPersistenceEngine {
    storage_dir: PathBuf,
    config: PersistenceConfig,
}

impl FileSystemPersistenceEngine {
    #[must_use]
    pub fn new(config: PersistenceConfig) -> Self {
        let storage_dir = PathBuf::from(&config.storage_dir);
        Self { storage_dir, config }
    }

    fn primary_path(&self) -> PathBuf {
        self.storage_dir.join("queue-state.json")
    }

    fn secondary_path(&self) -> PathBuf {
        self.storage_dir.join("queue-state-backup.json")
    }

    fn backups_dir(&self) -> PathBuf {
        self.storage_dir.join("backups")
    }

    fn temp_dir(&self) -> PathBuf {
        self.storage_dir.join("temp")
    }

    fn lock_path(&self) -> PathBuf {
        self.storage_dir.join("queue.lock")
    }

    fn metadata_path(&self) -> PathBuf {
        self.storage_dir.join("persistence-metadata.json")
    }

    /// `serialize -> encrypt -> compress`, each layer optional except
    /// serialization (spec.md §6's compose order).
    fn encode(&self, envelope: &SnapshotEnvelope) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(envelope)?;
        let layered = match &self.config.encryption_key {
            Some(key) => encryption::encrypt(key, &json)?,
            None => json,
        };
        if self.config.compression_enabled {
            compression::compress(&layered)
        } else {
            Ok(layered)
        }
    }

    /// `decompress -> decrypt -> parse`, the mirror of `encode`.
    fn decode(&self, bytes: &[u8]) -> Result<SnapshotEnvelope> {
        let layered = if self.config.compression_enabled {
            compression::decompress(bytes)?
        } else {
            bytes.to_vec()
        };
        let json = match &self.config.encryption_key {
            Some(key) => encryption::decrypt(key, &layered)?,
            None => layered,
        };
        let envelope: SnapshotEnvelope = serde_json::from_slice(&json)?;
        if envelope.schema_version > SCHEMA_VERSION {
            return Err(Error::Incompatible(format!(
                "snapshot schema {} is newer than the {} this build understands",
                envelope.schema_version, SCHEMA_VERSION
            )));
        }
        Ok(envelope)
    }

    async fn acquire_lock(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.storage_dir).await?;
        let lock_path = self.lock_path();
        for attempt in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    let payload = serde_json::json!({
                        "pid": std::process::id(),
                        "timestamp": Utc::now(),
                    });
                    file.write_all(payload.to_string().as_bytes()).await?;
                    file.sync_all().await?;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                    if !self.break_stale_lock(&lock_path).await? {
                        return Err(Error::Locked(format!("{} held by another writer", lock_path.display())));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(Error::Locked(format!("{} held by another writer", lock_path.display())));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Locked(lock_path.display().to_string()))
    }

    async fn break_stale_lock(&self, lock_path: &Path) -> Result<bool> {
        let contents = tokio::fs::read_to_string(lock_path).await?;
        let value: serde_json::Value = serde_json::from_str(&contents)?;
        let timestamp = value
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let Some(timestamp) = timestamp else {
            return Ok(false);
        };
        let age = Utc::now() - timestamp;
        if age > ChronoDuration::milliseconds(self.config.lock_stale_after_ms as i64) {
            tokio::fs::remove_file(lock_path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_lock(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.lock_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort directory fsync so the rename survives a crash; platforms
    /// where this isn't meaningful (or permitted) just no-op.
    async fn fsync_dir(&self, dir: &Path) {
        if let Ok(handle) = tokio::fs::File::open(dir).await {
            let _ = handle.sync_all().await;
        }
    }

    async fn snapshot_locked(&self, label: Option<String>, state: &RestoredState) -> Result<PathBuf> {
        let snapshot_id = SnapshotId::new();
        let created_at = Utc::now();
        let envelope = SnapshotEnvelope::new(snapshot_id, label, created_at, state.clone());
        let bytes = self.encode(&envelope)?;

        tokio::fs::create_dir_all(&self.temp_dir()).await?;
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let temp_path = self.temp_dir().join(format!("state-{nanos}.tmp"));

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        // Step 4: re-read what was just written and validate before it ever
        // becomes the primary snapshot.
        let reread = tokio::fs::read(&temp_path).await?;
        let reloaded = self.decode(&reread)?;
        validate_state(&reloaded.state)?;

        let primary = self.primary_path();
        tokio::fs::rename(&temp_path, &primary).await?;
        self.fsync_dir(&self.storage_dir).await;

        if self.config.enable_versioning {
            tokio::fs::create_dir_all(&self.backups_dir()).await?;
            let backup_name = format!("queue-state-{}.json", created_at.to_rfc3339());
            let backup_path = self.backups_dir().join(backup_name);
            if let Err(e) = tokio::fs::copy(&primary, &backup_path).await {
                warn!(error = %e, "failed to write versioned backup, continuing");
            } else if let Err(e) = self.prune_backups().await {
                warn!(error = %e, "backup retention pruning failed, continuing");
            }
        }
        // Rotated on every write regardless of versioning, independent of
        // the `backups/` directory it mirrors.
        if let Err(e) = tokio::fs::copy(&primary, &self.secondary_path()).await {
            warn!(error = %e, "failed to refresh secondary fallback copy");
        }

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let checksum = format!("{:x}", hasher.finalize());

        let metadata = PersistenceMetadata {
            last_snapshot_id: Some(snapshot_id),
            last_snapshot_at: Some(created_at),
            last_snapshot_path: Some(primary.clone()),
            backup_count: self.count_backups().await.unwrap_or(0),
            size: bytes.len() as u64,
            checksum,
        };
        tokio::fs::write(&self.metadata_path(), serde_json::to_vec_pretty(&metadata)?).await?;

        Ok(primary)
    }

    async fn prune_backups(&self) -> Result<()> {
        let mut backups = self.backups_by_mtime_ascending().await?;
        if backups.len() <= 1 {
            return Ok(());
        }
        let newest = backups.len() - 1;
        let cutoff = SystemTime::now()
            .checked_sub(StdDuration::from_secs(u64::from(self.config.backup_retention_days) * 86_400))
            .unwrap_or(UNIX_EPOCH);
        for (idx, (path, mtime)) in backups.drain(..).enumerate() {
            if idx == newest || mtime >= cutoff {
                continue;
            }
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(())
    }

    async fn backups_by_mtime_ascending(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        if !tokio::fs::try_exists(&self.backups_dir()).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.backups_dir()).await?;
        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if let Ok(modified) = metadata.modified() {
                backups.push((entry.path(), modified));
            }
        }
        backups.sort_by_key(|(_, mtime)| *mtime);
        Ok(backups)
    }

    async fn count_backups(&self) -> Result<usize> {
        Ok(self.backups_by_mtime_ascending().await?.len())
    }

    async fn try_load(&self, path: &Path) -> Option<SnapshotEnvelope> {
        let bytes = tokio::fs::read(path).await.ok()?;
        match self.decode(&bytes) {
            Ok(envelope) if validate_state(&envelope.state).is_ok() => Some(envelope),
            Ok(_) => {
                warn!(path = %path.display(), "snapshot failed cross-reference validation, skipping");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot failed to decode, skipping");
                None
            }
        }
    }

    fn accept_with_staleness_warning(&self, envelope: SnapshotEnvelope) -> RestoredState {
        let age = Utc::now() - envelope.created_at;
        let stale_after = ChronoDuration::milliseconds(self.config.recovery_stale_after_ms as i64);
        if age > stale_after {
            warn!(
                snapshot_id = %envelope.snapshot_id,
                age_ms = age.num_milliseconds(),
                "restored snapshot is older than recoveryStaleAfterMs, accepting anyway",
            );
        }
        envelope.state
    }

    async fn check_writable(&self) -> bool {
        if tokio::fs::create_dir_all(&self.storage_dir).await.is_err() {
            return false;
        }
        let probe = self.storage_dir.join(".write-probe");
        let writable = tokio::fs::write(&probe, b"ok").await.is_ok();
        let _ = tokio::fs::remove_file(&probe).await;
        writable
    }

    async fn read_metadata(&self) -> Option<PersistenceMetadata> {
        let bytes = tokio::fs::read(self.metadata_path()).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn disk_usage(&self) -> u64 {
        let mut total = 0u64;
        for path in [self.primary_path(), self.secondary_path(), self.metadata_path()] {
            if let Ok(metadata) = tokio::fs::metadata(&path).await {
                total += metadata.len();
            }
        }
        if let Ok(backups) = self.backups_by_mtime_ascending().await {
            for (path, _) in backups {
                if let Ok(metadata) = tokio::fs::metadata(&path).await {
                    total += metadata.len();
                }
            }
        }
        total
    }
}

#[async_trait]
impl PersistenceEngine for FileSystemPersistenceEngine {
    #[instrument(skip(self, state), fields(label = ?label))]
    async fn snapshot(&self, label: Option<String>, state: &RestoredState) -> Result<PathBuf> {
        validate_state(state)?;
        self.acquire_lock().await?;
        let result = self.snapshot_locked(label, state).await;
        self.release_lock().await?;
        result
    }

    #[instrument(skip(self))]
    async fn restore(&self) -> Result<RestoredState> {
        if let Some(envelope) = self.try_load(&self.primary_path()).await {
            return Ok(self.accept_with_staleness_warning(envelope));
        }
        if let Some(envelope) = self.try_load(&self.secondary_path()).await {
            warn!("primary snapshot unavailable, restored from secondary backup");
            return Ok(self.accept_with_staleness_warning(envelope));
        }
        for path in self.backups_by_mtime_ascending().await?.into_iter().rev().map(|(p, _)| p) {
            if let Some(envelope) = self.try_load(&path).await {
                warn!(path = %path.display(), "primary and secondary unavailable, restored from versioned backup");
                return Ok(self.accept_with_staleness_warning(envelope));
            }
        }
        info!("no valid snapshot found in any fallback location, starting clean");
        Ok(RestoredState::default())
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<StorageHealth> {
        let writable = self.check_writable().await;
        let primary_valid = self.try_load(&self.primary_path()).await.is_some();
        let backup_count = self.count_backups().await.unwrap_or(0);
        let last_sync_age_ms = self
            .read_metadata()
            .await
            .and_then(|m| m.last_snapshot_at)
            .map(|ts| (Utc::now() - ts).num_milliseconds().max(0) as u64);
        let disk_usage_bytes = self.disk_usage().await;
        Ok(StorageHealth { writable, primary_valid, backup_count, last_sync_age_ms, disk_usage_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use std::collections::HashSet as StdHashSet;
    use task_queue_common::ids::UuidGen;
    use task_queue_common::IdGen;
    use task_queue_core::types::{Constraints, ExecutorHandle, Priority, SchedulingHints, Task, TaskStatus};

    fn test_config(dir: &std::path::Path) -> PersistenceConfig {
        PersistenceConfig {
            storage_dir: dir.to_string_lossy().into_owned(),
            backup_retention_days: 7,
            compression_enabled: true,
            encryption_key: None,
            sync_interval_ms: 60_000,
            max_file_size: 100 * 1024 * 1024,
            enable_versioning: true,
            lock_stale_after_ms: 60_000,
            recovery_stale_after_ms: 24 * 60 * 60 * 1000,
        }
    }

    fn sample_state() -> RestoredState {
        let gen = UuidGen;
        let now = Utc::now();
        let task = Task {
            id: gen.task_id(),
            title: "t".into(),
            description: String::new(),
            kind: "noop".into(),
            priority: Priority::Normal,
            executor: ExecutorHandle { name: "noop".into(), parameters: serde_json::Value::Null },
            dependencies: StdHashSet::new(),
            constraints: Constraints::default(),
            scheduling: SchedulingHints::default(),
            estimated_duration: StdDuration::from_secs(1),
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: now,
            last_transition_at: now,
            tags: StdHashSet::new(),
        };
        RestoredState { tasks: vec![(task.id, task)], edges: Vec::new(), agents: Vec::new(), assignments: Vec::new() }
    }

    #[tokio::test]
    async fn snapshot_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileSystemPersistenceEngine::new(test_config(dir.path()));
        let state = sample_state();
        engine.snapshot(Some("test".into()), &state).await.unwrap();
        let restored = engine.restore().await.unwrap();
        assert_eq!(restored.tasks, state.tasks);
    }

    #[tokio::test]
    async fn restore_with_no_snapshot_returns_empty_default() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileSystemPersistenceEngine::new(test_config(dir.path()));
        let restored = engine.restore().await.unwrap();
        assert!(restored.tasks.is_empty());
    }

    #[tokio::test]
    async fn restore_falls_back_to_secondary_when_primary_missing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileSystemPersistenceEngine::new(test_config(dir.path()));
        let state = sample_state();
        engine.snapshot(None, &state).await.unwrap();
        tokio::fs::remove_file(engine.primary_path()).await.unwrap();
        let restored = engine.restore().await.unwrap();
        assert_eq!(restored.tasks, state.tasks);
    }

    #[tokio::test]
    async fn encrypted_snapshot_round_trips_with_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.encryption_key = Some(Secret::new("hunter2".to_string()));
        let engine = FileSystemPersistenceEngine::new(config);
        let state = sample_state();
        engine.snapshot(None, &state).await.unwrap();
        let restored = engine.restore().await.unwrap();
        assert_eq!(restored.tasks, state.tasks);
    }

    #[tokio::test]
    async fn health_check_reports_writable_storage() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileSystemPersistenceEngine::new(test_config(dir.path()));
        let health = engine.health_check().await.unwrap();
        assert!(health.writable);
        assert!(!health.primary_valid);
    }
}
