//! Configuration management for the task queue.
//!
//! Layered the way the teacher's config module is: defaults, then an
//! optional `config.toml`, then `TASKQ__`-prefixed environment overrides.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub persistence: PersistenceConfig,
    pub observability: ObservabilityConfig,
}

/// Scheduler timing and concurrency knobs (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub rebalance_interval_ms: u64,
    pub agent_heartbeat_timeout_ms: u64,
    pub abort_grace_ms: u64,
    pub command_queue_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            rebalance_interval_ms: 30_000,
            agent_heartbeat_timeout_ms: 30_000,
            abort_grace_ms: 5_000,
            command_queue_size: 1_000,
        }
    }
}

/// Persistence engine knobs (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    pub storage_dir: String,
    pub backup_retention_days: u32,
    pub compression_enabled: bool,
    pub encryption_key: Option<Secret<String>>,
    pub sync_interval_ms: u64,
    pub max_file_size: u64,
    pub enable_versioning: bool,
    pub lock_stale_after_ms: u64,
    pub recovery_stale_after_ms: u64,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub tracing_enabled: bool,
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Log format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Config {
    /// Load configuration from files and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("scheduler.tick_interval_ms", 100)?
            .set_default("scheduler.rebalance_interval_ms", 30_000)?
            .set_default("scheduler.agent_heartbeat_timeout_ms", 30_000)?
            .set_default("scheduler.abort_grace_ms", 5_000)?
            .set_default("scheduler.command_queue_size", 1_000)?
            .set_default("persistence.storage_dir", "./data")?
            .set_default("persistence.backup_retention_days", 7)?
            .set_default("persistence.compression_enabled", true)?
            .set_default("persistence.sync_interval_ms", 60_000)?
            .set_default("persistence.max_file_size", 100 * 1024 * 1024)?
            .set_default("persistence.enable_versioning", true)?
            .set_default("persistence.lock_stale_after_ms", 60_000)?
            .set_default("persistence.recovery_stale_after_ms", 24 * 60 * 60 * 1000)?
            .set_default("observability.metrics_enabled", true)?
            .set_default("observability.metrics_port", 9090)?
            .set_default("observability.tracing_enabled", true)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "json")?;

        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKQ")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration, returning a list of human-readable errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scheduler.tick_interval_ms == 0 {
            errors.push("scheduler.tick_interval_ms must be > 0".to_string());
        }
        if self.scheduler.rebalance_interval_ms == 0 {
            errors.push("scheduler.rebalance_interval_ms must be > 0".to_string());
        }
        if self.persistence.storage_dir.is_empty() {
            errors.push("persistence.storage_dir must not be empty".to_string());
        }
        if self.persistence.backup_retention_days == 0 {
            errors.push("persistence.backup_retention_days must be > 0".to_string());
        }
        if self.observability.metrics_enabled && self.observability.metrics_port == 0 {
            errors.push(
                "observability.metrics_port must be > 0 when metrics are enabled".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig {
                tick_interval_ms: 100,
                rebalance_interval_ms: 30_000,
                agent_heartbeat_timeout_ms: 30_000,
                abort_grace_ms: 5_000,
                command_queue_size: 1_000,
            },
            persistence: PersistenceConfig {
                storage_dir: "./data".to_string(),
                backup_retention_days: 7,
                compression_enabled: true,
                encryption_key: None,
                sync_interval_ms: 60_000,
                max_file_size: 100 * 1024 * 1024,
                enable_versioning: true,
                lock_stale_after_ms: 60_000,
                recovery_stale_after_ms: 24 * 60 * 60 * 1000,
            },
            observability: ObservabilityConfig {
                metrics_enabled: true,
                metrics_port: 9090,
                tracing_enabled: true,
                otlp_endpoint: None,
                log_level: "info".to_string(),
                log_format: LogFormat::Json,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        let mut config = Config::default();
        config.scheduler.tick_interval_ms = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("tick_interval_ms")));
    }
}
