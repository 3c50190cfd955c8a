//! Stage jobs and the queue workers pull them from.
//!
//! The queue only carries job ids. The job record in the [`crate::store::Store`]
//! is the source of truth: a job deleted from the store before a worker
//! picks it up is skipped, which is how cancellation removes jobs that have
//! not started yet.

mod barrier;

pub use barrier::{BarrierOutcome, JobBarrier, TimeoutPolicy};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::{JobId, RequestId};

/// Metadata key of the flag the barrier polls.
pub const LOCKED_KEY: &str = "locked";

/// Execution handle for one stage of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub request_id: RequestId,
    /// Index of the stage in the request's plan.
    pub stage_index: usize,
    /// Job that must signal unlock before this one may run.
    pub depends_on: Option<JobId>,
    /// Mutable metadata shared between workers.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a job in the locked state.
    pub fn new(id: JobId, request_id: RequestId, stage_index: usize, depends_on: Option<JobId>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(LOCKED_KEY.to_string(), serde_json::Value::Bool(true));
        Self {
            id,
            request_id,
            stage_index,
            depends_on,
            metadata,
            created_at: Utc::now(),
            started_at: None,
        }
    }

    /// Returns true until the job has signalled unlock.
    pub fn is_locked(&self) -> bool {
        self.metadata
            .get(LOCKED_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Clears the `locked` flag.
    pub fn unlock(&mut self) {
        self.metadata
            .insert(LOCKED_KEY.to_string(), serde_json::Value::Bool(false));
    }
}

/// Shared, unordered queue of job ids.
///
/// Any number of workers may pull from it concurrently. No ordering is
/// promised between jobs; stage order is enforced by the barrier.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<JobId>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<JobId>>>,
    closed: CancellationToken,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Enqueues a job for the next free worker.
    pub fn enqueue(&self, job: JobId) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::InvalidState("job queue is closed".to_string()));
        }
        self.tx
            .send(job)
            .map_err(|_| Error::InvalidState("job queue is closed".to_string()))
    }

    /// Waits for the next job id. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<JobId> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            job = rx.recv() => job,
            _ = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the queue. Workers drain what is left and then stop.
    pub fn close(&self) {
        self.closed.cancel();
    }
}
