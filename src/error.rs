//! Error types for sandbox allocation and cleanup.

use std::time::Duration;

use thiserror::Error;

use crate::lock::{LockHolder, LockScope};
use crate::model::{JobId, RequestId};

/// Top-level error type for orchestration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input, rejected synchronously and never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A live lock already exists for an overlapping scope.
    #[error("operation already in progress: {scope} is locked by {holder}")]
    LockConflict { scope: LockScope, holder: LockHolder },

    /// The stack provisioner failed to create or destroy a stack.
    #[error("stack provisioning failed: {0}")]
    Provision(String),

    /// A configuration run exited unsuccessfully.
    #[error("configuration run failed: {0}")]
    Configuration(String),

    /// The execution backend could not start the execution unit at all.
    #[error("execution backend unavailable: {0}")]
    RunnerUnavailable(String),

    /// Best-effort teardown of external state failed.
    #[error("ancillary cleanup failed: {0}")]
    AncillaryCleanup(String),

    /// A dependent job never signalled unlock within the barrier timeout.
    #[error("job {job} still locked after {waited:?}")]
    BarrierTimeout { job: JobId, waited: Duration },

    /// The request was cancelled while the stage was pending or running.
    #[error("request {0} was cancelled")]
    Cancelled(RequestId),

    /// A referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The record exists but is in the wrong state for the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The persistence layer failed.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration file error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Builds a `NotFound` error for the given record kind.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns true if the caller may retry the same operation later.
    ///
    /// The orchestrator itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockConflict { .. })
    }
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;
