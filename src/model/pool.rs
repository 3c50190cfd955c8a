//! Pools, allocation units and realized sandboxes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provisioner::StackHandle;

use super::{PoolId, RequestId, UnitId};

/// Reference to the declarative definition every sandbox in a pool is built from.
///
/// The definition format itself is opaque to the orchestrator; it is handed
/// to the stack provisioner and the configuration runner as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDefinition {
    /// Human-readable definition name.
    pub name: String,
    /// Where the definition lives (repository URL, path, ...).
    pub source: String,
    /// Revision of the definition to use.
    pub revision: String,
    /// Extra variables passed to the provisioner.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl StackDefinition {
    /// Creates a definition with no extra variables.
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            revision: revision.into(),
            variables: BTreeMap::new(),
        }
    }
}

/// A named capacity bound owning allocation units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    /// Maximum number of units the pool may own.
    pub max_size: usize,
    pub definition: StackDefinition,
    pub created_at: DateTime<Utc>,
}

impl Pool {
    /// Creates a new pool record.
    pub fn new(name: impl Into<String>, max_size: usize, definition: StackDefinition) -> Self {
        Self {
            id: PoolId::new(),
            name: name.into(),
            max_size,
            definition,
            created_at: Utc::now(),
        }
    }
}

/// The realized infrastructure produced by a finished allocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// Allocation request that produced this sandbox.
    pub request_id: RequestId,
    /// Handle of the provisioned stack.
    pub stack: StackHandle,
    pub created_at: DateTime<Utc>,
}

/// Long-lived identity of one sandbox slot in a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxAllocationUnit {
    pub id: UnitId,
    pub pool_id: PoolId,
    pub created_at: DateTime<Utc>,
    /// Latest allocation request, terminal or not.
    pub allocation_request: Option<RequestId>,
    /// Latest cleanup request, terminal or not.
    pub cleanup_request: Option<RequestId>,
    /// Present while the unit is allocated.
    pub sandbox: Option<Sandbox>,
}

impl SandboxAllocationUnit {
    /// Creates an empty unit in the given pool.
    pub fn new(pool_id: PoolId) -> Self {
        Self {
            id: UnitId::new(),
            pool_id,
            created_at: Utc::now(),
            allocation_request: None,
            cleanup_request: None,
            sandbox: None,
        }
    }

    /// Returns true if the unit currently owns a sandbox.
    pub fn is_allocated(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Deterministic stack name for this unit.
    ///
    /// Teardown relies on it to reach a stack whose creation never recorded
    /// a handle.
    pub fn stack_name(&self) -> String {
        let pool = self.pool_id.to_string();
        let unit = self.id.to_string();
        format!("pool-{}-sandbox-{}", &pool[..8], &unit[..8])
    }
}
