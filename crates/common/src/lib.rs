#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Ambient stack shared by every task-queue crate: error types, layered
//! configuration, structured logging/tracing setup, metrics, the clock
//! abstraction and id generation.

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod telemetry;

pub use clock::Clock;
pub use config::Config;
pub use error::{Error, Result};
pub use ids::IdGen;

/// Re-export commonly used external types so downstream crates don't need
/// a direct dependency on `uuid`/`chrono`/`serde` for the shared vocabulary.
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;