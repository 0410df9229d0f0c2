#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Concrete, runnable implementation of the task queue's execution
//! controller: a `petgraph`-backed dependency graph, `dashmap`-backed
//! registries, a `tokio::sync::broadcast` event bus, and the scheduler
//! loop that ties them together.

pub mod dag;
pub mod events;
pub mod registry;
pub mod scheduler;

pub use dag::{MapTaskLookup, PetgraphDependencyGraph};
pub use events::TokioEventBus;
pub use registry::{DashMapAgentRegistry, DashMapAssignmentTable, DashMapTaskRegistry};
pub use scheduler::{Request, Scheduler, SchedulerHandle};
