//! Opaque id generation and newtypes.
//!
//! Ids are `Uuid`s wrapped in small newtypes so a `TaskId` can never be
//! passed where an `AgentId` is expected by accident, while remaining
//! `Copy`/`Hash`/`Serialize` like the bare `Uuid` the teacher used.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_newtype!(TaskId);
id_newtype!(EdgeId);
id_newtype!(AgentId);
id_newtype!(AssignmentId);
id_newtype!(SnapshotId);

/// Generates opaque unique ids. A trait (rather than bare `Uuid::new_v4`
/// calls scattered around) so tests can substitute a deterministic sequence.
pub trait IdGen: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn edge_id(&self) -> EdgeId;
    fn agent_id(&self) -> AgentId;
    fn assignment_id(&self) -> AssignmentId;
    fn snapshot_id(&self) -> SnapshotId;
}

/// `IdGen` backed by `Uuid::new_v4`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn task_id(&self) -> TaskId {
        TaskId::new()
    }

    fn edge_id(&self) -> EdgeId {
        EdgeId::new()
    }

    fn agent_id(&self) -> AgentId {
        AgentId::new()
    }

    fn assignment_id(&self) -> AssignmentId {
        AssignmentId::new()
    }

    fn snapshot_id(&self) -> SnapshotId {
        SnapshotId::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let gen = UuidGen;
        assert_ne!(gen.task_id(), gen.task_id());
    }
}
