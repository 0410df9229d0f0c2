//! Error types for the task queue

use thiserror::Error;

/// Main error type shared across the queue
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// A submission referenced a task id that is already present
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// A submission referenced a task/agent id that does not exist
    #[error("unknown id: {0}")]
    UnknownId(String),

    /// An edge would make a task depend on itself
    #[error("self loop on task: {0}")]
    SelfLoop(String),

    /// Adding an edge would introduce a cycle
    #[error("would create a cycle: {0}")]
    WouldCycle(String),

    /// A constraint on a task submission could not be satisfied
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    /// An operation was attempted against a task in the wrong state
    #[error("wrong state: {0}")]
    WrongState(String),

    /// Scheduling/orchestration errors
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// Timeout errors
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Persistence file set is locked by another writer
    #[error("storage locked: {0}")]
    Locked(String),

    /// A persisted snapshot failed validation
    #[error("snapshot corrupt: {0}")]
    Corrupt(String),

    /// A persisted snapshot has an incompatible schema version
    #[error("incompatible snapshot version: {0}")]
    Incompatible(String),

    /// Validation errors
    #[error("validation failed: {0}")]
    Validation(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    /// Unknown errors
    #[error("unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller should treat this as retryable (transient) or not.
    ///
    /// Mirrors §7's propagation policy: capacity/transient/agent-loss errors
    /// recover locally, validation errors surface to the caller, invariant
    /// violations halt. This classifier only covers the first bucket.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Locked(_))
    }

    /// Severity bucket for metrics labeling.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Error::Config(_) | Error::Corrupt(_) | Error::Incompatible(_) => {
                ErrorSeverity::Critical
            }
            Error::Scheduling(_) | Error::WrongState(_) => ErrorSeverity::High,
            Error::Timeout(_) | Error::Locked(_) => ErrorSeverity::Medium,
            Error::Validation(_)
            | Error::DuplicateId(_)
            | Error::UnknownId(_)
            | Error::SelfLoop(_)
            | Error::WouldCycle(_)
            | Error::InvalidConstraint(_) => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}
