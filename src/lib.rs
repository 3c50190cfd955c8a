//! Sandbox Allocator - staged provisioning and teardown of pooled sandboxes
//!
//! This library provisions isolated sandbox environments (an infrastructure
//! stack plus network and user configuration) out of capacity-bounded pools,
//! and tears them down again, guaranteeing that no two operations mutate the
//! same sandbox or pool at once.

pub mod backoff;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod pipeline;
pub mod provisioner;
pub mod queue;
pub mod reconciler;
pub mod runner;
pub mod service;
pub mod store;

pub use config::{Config, Validate, ValidationResult};
pub use error::{Error, Result};
pub use lock::{Lock, LockHolder, LockManager, LockScope};
pub use model::{
    JobId, LockId, Pool, PoolId, Request, RequestId, RequestKind, RequestStatus, Sandbox,
    SandboxAllocationUnit, Stage, StageKind, StageOutput, StageStatus, StackDefinition, UnitId,
};
pub use pipeline::{PipelineEngine, RecoveryReport, RequestReport};
pub use provisioner::{ImageRef, NodeAction, ProvisionerBackend, StackHandle, StackNode, StackProvisioner};
pub use queue::{BarrierOutcome, Job, JobBarrier, JobQueue, TimeoutPolicy};
pub use reconciler::{CleanupReconciler, CredentialRemover, SshCredentialRemover};
pub use runner::{ExecutionBackend, ExecutionUnit, ExitStatus, LogBuffer, LogCursor, RunHandle, RunSpec};
pub use service::{Backends, SandboxService};
pub use store::{MemoryStore, Store};
