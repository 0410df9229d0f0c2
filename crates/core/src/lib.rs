#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Domain model and pure-logic contracts for the task queue: the types
//! flowing through it, the DAG/registry/persistence seams the scheduler is
//! built against, and the scoring/retry rules driving its decisions.

pub mod control;
pub mod events;
pub mod graph;
pub mod persistence;
pub mod registry;
pub mod retry;
pub mod scoring;
pub mod types;

pub use control::{Command, NewTask, QueueStatusReport, Response, TaskInfoReport};
pub use events::{Event, EventBus};
pub use graph::{CriticalPath, DependencyGraph, TaskLookup};
pub use persistence::{PersistenceEngine, RestoreCounts, RestoredState, StorageHealth};
pub use registry::{AgentRegistry, AssignmentTable, TaskRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use scoring::{score, ScoringInput};
