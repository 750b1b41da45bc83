//! Strongly-typed entity identifiers.
//!
//! The source ORM models used bare UUIDs everywhere; here each entity kind
//! gets its own newtype so a `TaskId` can never be passed where a
//! `WorkspaceId` is expected.

use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type, serde::Serialize, serde::Deserialize)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

uuid_id!(WorkspaceId);
uuid_id!(CronTaskId);
uuid_id!(DelayedTaskId);
uuid_id!(TaskChainId);
uuid_id!(ChainStepId);
uuid_id!(HeartbeatId);
uuid_id!(ProcessMonitorId);
uuid_id!(ExecutionId);
uuid_id!(ChainExecutionId);
uuid_id!(StepExecutionId);
uuid_id!(WorkerId);
