//! Durable records for pools, allocation units, requests and jobs.
//!
//! Every type here is a plain serializable record. Mutation rules live in the
//! components that own them: the pipeline engine mutates requests and
//! stages, the lock manager owns lock rows.

mod pool;
mod request;

pub use pool::{Pool, Sandbox, SandboxAllocationUnit, StackDefinition};
pub use request::{Request, RequestKind, RequestStatus, Stage, StageKind, StageOutput, StageStatus};

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

record_id!(
    /// Identity of a [`Pool`].
    PoolId
);
record_id!(
    /// Identity of a [`SandboxAllocationUnit`].
    UnitId
);
record_id!(
    /// Identity of an allocation or cleanup [`Request`].
    RequestId
);
record_id!(
    /// Identity of a queued stage [`crate::queue::Job`].
    JobId
);
record_id!(
    /// Identity of a [`crate::lock::Lock`] row.
    LockId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_display() {
        let id = UnitId::new();
        let parsed: UnitId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_serialize_as_bare_uuid_strings() {
        let id = PoolId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn fresh_ids_differ() {
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
