//! Stage pipeline engine.
//!
//! A request runs its stages strictly in plan order. Only the first stage's
//! job is enqueued when the request is created; each later job is created
//! and enqueued once its predecessor finished and signalled unlock. Workers
//! still wait on the predecessor through the [`JobBarrier`] because the queue
//! makes no ordering promise.
//!
//! The unit lock taken before the first job is enqueued is held by the
//! request until [`PipelineEngine`] finalizes it, on every exit path.

mod executor;

pub use executor::{StageContext, StageExecutor, StageFailure};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::config::BarrierConfig;
use crate::error::{Error, Result};
use crate::lock::{LockHolder, LockManager, LockScope};
use crate::model::{
    JobId, Request, RequestId, RequestKind, RequestStatus, Sandbox, SandboxAllocationUnit, Stage,
    StageKind, StageOutput, StageStatus, UnitId,
};
use crate::provisioner::StackHandle;
use crate::queue::{Job, JobBarrier, JobQueue};
use crate::reconciler::CleanupReconciler;
use crate::store::Store;

/// Caller-facing view of a request: aggregate status plus per-stage detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReport {
    pub id: RequestId,
    pub kind: RequestKind,
    pub unit_id: UnitId,
    pub status: RequestStatus,
    pub cancelled: bool,
    /// Stages created so far.
    pub stages: Vec<Stage>,
    /// Planned stages that have not been created yet.
    pub remaining: Vec<StageKind>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Request> for RequestReport {
    fn from(request: &Request) -> Self {
        Self {
            id: request.id,
            kind: request.kind,
            unit_id: request.unit_id,
            status: request.status(),
            cancelled: request.cancelled,
            stages: request.stages.clone(),
            remaining: request.plan[request.stages.len()..].to_vec(),
            created_at: request.created_at,
            finished_at: request.finished_at,
        }
    }
}

/// What a recovery sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Requests failed because a stage was running when the process stopped.
    pub requests_failed: usize,
    /// Jobs put back on the queue.
    pub jobs_requeued: usize,
    /// Terminal requests whose finalization had not completed.
    pub requests_finalized: usize,
    pub locks_released: usize,
}

struct EngineInner {
    store: Arc<dyn Store>,
    locks: LockManager,
    barrier: JobBarrier,
    queue: JobQueue,
    executor: StageExecutor,
    reconciler: CleanupReconciler,
    tokens: Mutex<HashMap<RequestId, CancellationToken>>,
}

/// Drives allocation and cleanup requests through their stages.
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn Store>,
        executor: StageExecutor,
        reconciler: CleanupReconciler,
        barrier: &BarrierConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                locks: LockManager::new(store.clone()),
                barrier: JobBarrier::new(store.clone(), barrier),
                queue: JobQueue::new(),
                store,
                executor,
                reconciler,
                tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Starts `count` workers pulling jobs until the queue is closed.
    pub fn spawn_workers(&self, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let engine = self.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker, "worker started");
                    while let Some(job_id) = engine.inner.queue.next().await {
                        if let Err(e) = engine.process_job(job_id).await {
                            tracing::error!(worker, job_id = %job_id, error = %e, "job processing failed");
                        }
                    }
                    tracing::debug!(worker, "worker stopped");
                })
            })
            .collect()
    }

    /// Stops handing out jobs. Running stages finish; nothing new starts.
    pub fn shutdown(&self) {
        self.inner.queue.close();
    }

    /// Creates a request for `unit_id` and enqueues its first stage.
    ///
    /// Fails with `LockConflict` if the unit (or its pool) is locked, and
    /// with `InvalidState` once the engine is shutting down. A request that
    /// cannot be fully submitted holds no lock and leaves the unit as it was.
    pub async fn start_request(&self, unit_id: UnitId, kind: RequestKind) -> Result<RequestId> {
        if self.inner.queue.is_closed() {
            return Err(Error::InvalidState("pipeline is shutting down".to_string()));
        }

        let store = &self.inner.store;
        let unit = store.get_unit(unit_id).await?;

        let first_job = JobId::new();
        let request = Request::new(kind, unit_id, unit.pool_id, first_job);
        let request_id = request.id;

        let lock = self
            .inner
            .locks
            .acquire(
                LockScope::Unit {
                    pool: unit.pool_id,
                    unit: unit_id,
                },
                LockHolder::Request(request_id),
                None,
            )
            .await?;

        let unit = match self.admit(unit_id, kind).await {
            Ok(unit) => unit,
            Err(e) => {
                self.inner.locks.release(&lock).await?;
                return Err(e);
            }
        };
        let previous = match kind {
            RequestKind::Allocation => unit.allocation_request,
            RequestKind::Cleanup => unit.cleanup_request,
        };

        if let Err(e) = self.submit(request, first_job).await {
            tracing::error!(request_id = %request_id, unit_id = %unit_id, error = %e, "request not submitted");
            self.abandon(request_id, unit_id, kind, previous, &e).await;
            self.inner.locks.release(&lock).await?;
            return Err(e);
        }

        tracing::info!(request_id = %request_id, unit_id = %unit_id, kind = ?kind, "request created");
        Ok(request_id)
    }

    /// Whether the unit was ever allocated, and whether a FINISHED cleanup
    /// was created after its latest allocation.
    async fn allocation_history(&self, unit: &SandboxAllocationUnit) -> Result<(bool, bool)> {
        let store = &self.inner.store;
        let latest_allocation = match unit.allocation_request {
            Some(id) => store.get_request(id).await?,
            None => return Ok((false, false)),
        };
        let cleaned = match unit.cleanup_request {
            Some(id) => {
                let cleanup = store.get_request(id).await?;
                cleanup.status() == RequestStatus::Finished
                    && cleanup.created_at >= latest_allocation.created_at
            }
            None => false,
        };
        Ok((true, cleaned))
    }

    /// Returns true if the unit's latest allocation may have left a stack
    /// behind that no finished cleanup has torn down, even when the
    /// allocation failed and recorded no sandbox.
    pub async fn needs_cleanup(&self, unit: &SandboxAllocationUnit) -> Result<bool> {
        let (allocated, cleaned) = self.allocation_history(unit).await?;
        Ok(allocated && !cleaned)
    }

    /// Persists a request with its first job, points the unit at it and
    /// enqueues the job.
    async fn submit(&self, request: Request, first_job: JobId) -> Result<()> {
        let store = &self.inner.store;
        let request_id = request.id;
        let unit_id = request.unit_id;
        let kind = request.kind;

        store.insert_request(request).await?;
        store
            .insert_job(Job::new(first_job, request_id, 0, None))
            .await?;
        store
            .modify_unit(
                unit_id,
                Box::new(move |u: &mut SandboxAllocationUnit| {
                    match kind {
                        RequestKind::Allocation => u.allocation_request = Some(request_id),
                        RequestKind::Cleanup => u.cleanup_request = Some(request_id),
                    }
                    Ok(())
                }),
            )
            .await?;

        self.token(request_id);
        self.inner.queue.enqueue(first_job)
    }

    /// Undoes whatever part of [`Self::submit`] took effect. Best effort:
    /// failures are logged so the caller still sees the original error.
    async fn abandon(
        &self,
        request_id: RequestId,
        unit_id: UnitId,
        kind: RequestKind,
        previous: Option<RequestId>,
        reason: &Error,
    ) {
        let store = &self.inner.store;
        self.forget_token(request_id);

        let message = format!("request not submitted: {}", reason);
        let failed = store
            .modify_request(
                request_id,
                Box::new(move |r: &mut Request| {
                    if let Some(stage) = r.stage_mut(0) {
                        if !stage.status.is_terminal() {
                            stage.fail(message, None);
                        }
                    }
                    r.finished_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await;
        match failed {
            Ok(_) | Err(Error::NotFound { .. }) => {}
            Err(e) => tracing::warn!(request_id = %request_id, error = %e, "could not fail abandoned request"),
        }

        match store.list_jobs(request_id).await {
            Ok(jobs) => {
                for job in jobs {
                    if let Err(e) = store.delete_job(job.id).await {
                        tracing::warn!(request_id = %request_id, job_id = %job.id, error = %e, "could not delete abandoned job");
                    }
                }
            }
            Err(e) => tracing::warn!(request_id = %request_id, error = %e, "could not list abandoned jobs"),
        }

        let restored = store
            .modify_unit(
                unit_id,
                Box::new(move |u: &mut SandboxAllocationUnit| {
                    let pointer = match kind {
                        RequestKind::Allocation => &mut u.allocation_request,
                        RequestKind::Cleanup => &mut u.cleanup_request,
                    };
                    if *pointer == Some(request_id) {
                        *pointer = previous;
                    }
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = restored {
            tracing::warn!(unit_id = %unit_id, error = %e, "could not restore unit after abandoned request");
        }
    }

    /// Checks, under the unit lock, that the unit may move in `kind`'s
    /// direction, and returns the unit as read under that lock.
    async fn admit(&self, unit_id: UnitId, kind: RequestKind) -> Result<SandboxAllocationUnit> {
        let unit = self.inner.store.get_unit(unit_id).await?;
        let (allocated_before, cleaned_after_allocation) = self.allocation_history(&unit).await?;

        match kind {
            RequestKind::Allocation => {
                if unit.is_allocated() {
                    return Err(Error::InvalidState(format!("unit {} already has a sandbox", unit_id)));
                }
                if allocated_before && !cleaned_after_allocation {
                    return Err(Error::InvalidState(format!(
                        "unit {} must be cleaned up before it is allocated again",
                        unit_id
                    )));
                }
            }
            RequestKind::Cleanup => {
                if !allocated_before {
                    return Err(Error::InvalidState(format!("unit {} was never allocated", unit_id)));
                }
                if cleaned_after_allocation {
                    return Err(Error::InvalidState(format!("unit {} is already clean", unit_id)));
                }
            }
        }
        Ok(unit)
    }

    pub async fn get_request_status(&self, request_id: RequestId) -> Result<RequestReport> {
        let request = self.inner.store.get_request(request_id).await?;
        Ok(RequestReport::from(&request))
    }

    /// Polls until the request has been finalized or `timeout` elapses.
    pub async fn wait_for_request(&self, request_id: RequestId, timeout: Duration) -> Result<RequestReport> {
        let poll = self.poll_until_finalized(request_id);
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            Error::InvalidState(format!(
                "request {} did not finish within {:?}",
                request_id, timeout
            ))
        })?
    }

    async fn poll_until_finalized(&self, request_id: RequestId) -> Result<RequestReport> {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(20), Duration::from_secs(1));
        loop {
            let request = self.inner.store.get_request(request_id).await?;
            if request.finished_at.is_some() {
                return Ok(RequestReport::from(&request));
            }
            backoff.wait().await;
        }
    }

    /// Cancels a request.
    ///
    /// A stage that has not started is failed right away and its job
    /// removed; a running stage is interrupted and fails through the normal
    /// path once its worker notices.
    pub async fn cancel_request(&self, request_id: RequestId) -> Result<RequestReport> {
        let updated = self
            .inner
            .store
            .modify_request(
                request_id,
                Box::new(move |r: &mut Request| {
                    if r.is_terminal() {
                        return Err(Error::InvalidState(format!(
                            "request {} already finished",
                            r.id
                        )));
                    }
                    r.cancelled = true;
                    let pending = r
                        .current_stage()
                        .filter(|(_, s)| s.status == StageStatus::Pending)
                        .map(|(index, _)| index);
                    if let Some(stage) = pending.and_then(|index| r.stage_mut(index)) {
                        stage.fail(Error::Cancelled(request_id).to_string(), None);
                    }
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(request_id = %request_id, "request cancelled");

        if updated.is_terminal() {
            self.finalize(request_id).await?;
        } else {
            self.token(request_id).cancel();
        }
        self.get_request_status(request_id).await
    }

    fn token(&self, request_id: RequestId) -> CancellationToken {
        let mut tokens = self
            .inner
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.entry(request_id).or_default().clone()
    }

    fn forget_token(&self, request_id: RequestId) {
        let mut tokens = self
            .inner
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.remove(&request_id);
    }

    /// Runs one job: wait for the predecessor, execute, record, advance.
    pub async fn process_job(&self, job_id: JobId) -> Result<()> {
        let store = &self.inner.store;
        let Some(job) = store.get_job(job_id).await? else {
            tracing::debug!(job_id = %job_id, "skipping job that no longer exists");
            return Ok(());
        };
        let request_id = job.request_id;
        let index = job.stage_index;

        if let Some(predecessor) = job.depends_on {
            if let Err(e) = self.inner.barrier.wait(predecessor).await {
                return self.record_failure(&job, StageFailure::from(e)).await;
            }
        }

        let started = store
            .modify_request(
                request_id,
                Box::new(move |r: &mut Request| {
                    if r.cancelled {
                        return Err(Error::Cancelled(r.id));
                    }
                    if index > 0 {
                        let predecessor = r.stages.get(index - 1).map(|s| s.status);
                        if predecessor != Some(StageStatus::Finished) {
                            return Err(Error::InvalidState(format!(
                                "stage {} started before its predecessor finished",
                                index
                            )));
                        }
                    }
                    let stage = r
                        .stage_mut(index)
                        .ok_or_else(|| Error::not_found("stage", index))?;
                    if stage.status != StageStatus::Pending {
                        return Err(Error::InvalidState(format!(
                            "stage {} is already {:?}",
                            index, stage.status
                        )));
                    }
                    stage.start();
                    Ok(())
                }),
            )
            .await;

        let request = match started {
            Ok(request) => request,
            Err(Error::Cancelled(_)) => {
                tracing::debug!(request_id = %request_id, job_id = %job_id, "job of cancelled request skipped");
                return Ok(());
            }
            Err(Error::InvalidState(msg)) => {
                tracing::warn!(request_id = %request_id, job_id = %job_id, reason = %msg, "job not started");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let stage = request.plan[index];
        tracing::info!(request_id = %request_id, stage = stage.as_str(), "stage started");

        let ctx = match self.context(&request, stage).await {
            Ok(ctx) => ctx,
            Err(e) => return self.record_failure(&job, StageFailure::from(e)).await,
        };
        let token = self.token(request_id);

        match self.inner.executor.execute(&ctx, &token).await {
            Ok(output) => self.record_success(&job, output).await,
            Err(failure) => self.record_failure(&job, failure).await,
        }
    }

    async fn context(&self, request: &Request, stage: StageKind) -> Result<StageContext> {
        let store = &self.inner.store;
        let unit = store.get_unit(request.unit_id).await?;
        let pool = store.get_pool(request.pool_id).await?;
        let stack = match stage {
            StageKind::Stack => None,
            _ => self.stack_for(request, &unit).await?,
        };
        Ok(StageContext {
            request_id: request.id,
            kind: request.kind,
            stage,
            unit,
            pool,
            stack,
        })
    }

    /// Stack a configuration stage runs against.
    ///
    /// Allocation uses its own stack stage's output. Cleanup uses the
    /// recorded sandbox, or the stack of the latest allocation attempt when
    /// that attempt failed after provisioning.
    async fn stack_for(&self, request: &Request, unit: &SandboxAllocationUnit) -> Result<Option<StackHandle>> {
        let source = match request.kind {
            RequestKind::Allocation => Some(request.clone()),
            RequestKind::Cleanup => {
                if let Some(sandbox) = &unit.sandbox {
                    return Ok(Some(sandbox.stack.clone()));
                }
                match unit.allocation_request {
                    Some(id) => Some(self.inner.store.get_request(id).await?),
                    None => None,
                }
            }
        };
        Ok(source
            .as_ref()
            .and_then(|r| r.finished_output(StageKind::Stack))
            .and_then(|o| serde_json::from_value(o.data.clone()).ok()))
    }

    async fn record_success(&self, job: &Job, output: StageOutput) -> Result<()> {
        let index = job.stage_index;
        let request = self
            .inner
            .store
            .modify_request(
                job.request_id,
                Box::new(move |r: &mut Request| {
                    let cancelled = r.cancelled;
                    let id = r.id;
                    let stage = r
                        .stage_mut(index)
                        .ok_or_else(|| Error::not_found("stage", index))?;
                    if cancelled {
                        stage.fail(Error::Cancelled(id).to_string(), Some(output));
                    } else {
                        stage.finish(output);
                    }
                    Ok(())
                }),
            )
            .await?;

        let stage = &request.stages[index];
        tracing::info!(
            request_id = %request.id,
            stage = stage.kind.as_str(),
            status = ?stage.status,
            "stage ended"
        );

        self.inner.barrier.signal_unlock(job.id).await?;
        self.advance(job.request_id, index, job.id).await
    }

    async fn record_failure(&self, job: &Job, failure: StageFailure) -> Result<()> {
        let index = job.stage_index;
        let message = failure.error.to_string();
        let output = failure.output;
        tracing::error!(
            request_id = %job.request_id,
            stage_index = index,
            error = %message,
            "stage failed"
        );

        let recorded = self
            .inner
            .store
            .modify_request(
                job.request_id,
                Box::new(move |r: &mut Request| {
                    let stage = r
                        .stage_mut(index)
                        .ok_or_else(|| Error::not_found("stage", index))?;
                    if stage.status.is_terminal() {
                        return Err(Error::InvalidState(format!("stage {} already ended", index)));
                    }
                    stage.fail(message, output);
                    Ok(())
                }),
            )
            .await;

        match recorded {
            Ok(_) => {}
            Err(Error::InvalidState(msg)) => {
                tracing::debug!(request_id = %job.request_id, reason = %msg, "failure not recorded");
            }
            Err(e) => return Err(e),
        }

        self.inner.barrier.signal_unlock(job.id).await?;
        self.advance(job.request_id, index, job.id).await
    }

    /// Creates and enqueues the next stage, or finalizes a terminal request.
    async fn advance(&self, request_id: RequestId, index: usize, job_id: JobId) -> Result<()> {
        let store = &self.inner.store;
        let next_job = JobId::new();
        let request = store
            .modify_request(
                request_id,
                Box::new(move |r: &mut Request| {
                    if r.stages.len() == index + 1 {
                        r.push_next_stage(next_job);
                    }
                    Ok(())
                }),
            )
            .await?;

        let pushed = request
            .stages
            .get(index + 1)
            .is_some_and(|s| s.job_id == Some(next_job));
        if pushed {
            store
                .insert_job(Job::new(next_job, request_id, index + 1, Some(job_id)))
                .await?;
            self.inner.queue.enqueue(next_job)?;
            tracing::debug!(request_id = %request_id, stage_index = index + 1, "next stage enqueued");
            return Ok(());
        }

        if request.is_terminal() {
            self.finalize(request_id).await?;
        }
        Ok(())
    }

    /// Applies a terminal request's outcome to its unit and releases
    /// everything the request held. Safe to run more than once.
    async fn finalize(&self, request_id: RequestId) -> Result<()> {
        let store = &self.inner.store;
        let request = store.get_request(request_id).await?;
        let status = request.status();

        match (request.kind, status) {
            (RequestKind::Allocation, RequestStatus::Finished) => {
                let recorded = request
                    .finished_output(StageKind::Stack)
                    .and_then(|o| serde_json::from_value::<StackHandle>(o.data.clone()).ok());
                let stack = match recorded {
                    Some(stack) => stack,
                    None => {
                        tracing::warn!(request_id = %request_id, "stack output unreadable, recording bare stack name");
                        let unit = store.get_unit(request.unit_id).await?;
                        StackHandle {
                            name: unit.stack_name(),
                            nodes: Vec::new(),
                            outputs: Default::default(),
                        }
                    }
                };
                let sandbox = Sandbox {
                    request_id,
                    stack,
                    created_at: Utc::now(),
                };
                store
                    .modify_unit(
                        request.unit_id,
                        Box::new(move |u: &mut SandboxAllocationUnit| {
                            u.sandbox = Some(sandbox);
                            Ok(())
                        }),
                    )
                    .await?;
            }
            (RequestKind::Cleanup, _) => {
                if status == RequestStatus::Finished {
                    store
                        .modify_unit(
                            request.unit_id,
                            Box::new(|u: &mut SandboxAllocationUnit| {
                                u.sandbox = None;
                                Ok(())
                            }),
                        )
                        .await?;
                }
                self.inner.reconciler.reconcile(request.unit_id).await;
            }
            (RequestKind::Allocation, _) => {}
        }

        for job in store.list_jobs(request_id).await? {
            store.delete_job(job.id).await?;
        }
        self.forget_token(request_id);
        let released = self
            .inner
            .locks
            .release_held_by(LockHolder::Request(request_id))
            .await?;

        store
            .modify_request(
                request_id,
                Box::new(|r: &mut Request| {
                    for stage in &mut r.stages {
                        stage.job_id = None;
                    }
                    if r.finished_at.is_none() {
                        r.finished_at = Some(Utc::now());
                    }
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(
            request_id = %request_id,
            unit_id = %request.unit_id,
            status = ?status,
            locks_released = released,
            "request finalized"
        );
        Ok(())
    }

    /// Reconciles requests interrupted by a restart, then stale locks.
    ///
    /// Must run before workers start.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let store = &self.inner.store;
        let mut report = RecoveryReport::default();

        for request in store.list_requests().await? {
            if request.finished_at.is_some() {
                continue;
            }
            if request.is_terminal() {
                self.finalize(request.id).await?;
                report.requests_finalized += 1;
                continue;
            }

            let Some((index, stage)) = request.current_stage() else {
                continue;
            };
            let stage_job = stage.job_id.unwrap_or_default();
            match stage.status {
                StageStatus::Running => {
                    tracing::warn!(request_id = %request.id, stage_index = index, "failing stage interrupted by restart");
                    let job = Job::new(stage_job, request.id, index, None);
                    self.record_failure(
                        &job,
                        StageFailure::from(Error::InvalidState(
                            "interrupted by orchestrator restart".to_string(),
                        )),
                    )
                    .await?;
                    report.requests_failed += 1;
                }
                StageStatus::Pending => {
                    let depends_on = index
                        .checked_sub(1)
                        .and_then(|i| request.stages.get(i))
                        .and_then(|s| s.job_id);
                    if let Some(predecessor) = depends_on {
                        self.inner.barrier.signal_unlock(predecessor).await?;
                    }
                    if store.get_job(stage_job).await?.is_none() {
                        store
                            .insert_job(Job::new(stage_job, request.id, index, depends_on))
                            .await?;
                    }
                    self.inner.queue.enqueue(stage_job)?;
                    report.jobs_requeued += 1;
                }
                StageStatus::Finished => {
                    self.inner.barrier.signal_unlock(stage_job).await?;
                    self.advance(request.id, index, stage_job).await?;
                    report.jobs_requeued += 1;
                }
                StageStatus::Failed => {}
            }
        }

        report.locks_released = self.inner.locks.recover().await?;
        tracing::info!(?report, "recovery sweep finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::lock::Lock;
    use crate::model::{LockId, Pool, PoolId, StackDefinition};
    use crate::provisioner::{ImageRef, NodeAction, ProvisionerBackend, StackProvisioner};
    use crate::runner::{ExecutionBackend, RunHandle, RunSpec};
    use crate::store::{MemoryStore, Mutation};
    use async_trait::async_trait;

    /// Backends for tests that never get as far as running stage work.
    struct Unreachable;

    #[async_trait]
    impl ProvisionerBackend for Unreachable {
        async fn create(&self, name: &str, _: &StackDefinition) -> Result<StackHandle> {
            Err(Error::Provision(format!("unexpected create of {}", name)))
        }
        async fn destroy(&self, name: &str) -> Result<()> {
            Err(Error::Provision(format!("unexpected destroy of {}", name)))
        }
        async fn fetch_images(&self) -> Result<Vec<ImageRef>> {
            Ok(Vec::new())
        }
        async fn node_action(&self, _: &str, _: &str, _: NodeAction) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "unreachable"
        }
    }

    #[async_trait]
    impl ExecutionBackend for Unreachable {
        async fn start(&self, spec: RunSpec) -> Result<RunHandle> {
            Err(Error::RunnerUnavailable(format!("unexpected run of {}", spec.name)))
        }
        fn name(&self) -> &str {
            "unreachable"
        }
    }

    /// Memory store whose job inserts fail.
    struct JoblessStore(MemoryStore);

    #[async_trait]
    impl Store for JoblessStore {
        async fn insert_pool(&self, pool: Pool) -> Result<()> {
            self.0.insert_pool(pool).await
        }
        async fn get_pool(&self, id: PoolId) -> Result<Pool> {
            self.0.get_pool(id).await
        }
        async fn list_pools(&self) -> Result<Vec<Pool>> {
            self.0.list_pools().await
        }
        async fn modify_pool(&self, id: PoolId, mutation: Mutation<Pool>) -> Result<Pool> {
            self.0.modify_pool(id, mutation).await
        }
        async fn delete_pool(&self, id: PoolId) -> Result<()> {
            self.0.delete_pool(id).await
        }
        async fn insert_unit(&self, unit: SandboxAllocationUnit) -> Result<()> {
            self.0.insert_unit(unit).await
        }
        async fn get_unit(&self, id: UnitId) -> Result<SandboxAllocationUnit> {
            self.0.get_unit(id).await
        }
        async fn list_units(&self, pool: PoolId) -> Result<Vec<SandboxAllocationUnit>> {
            self.0.list_units(pool).await
        }
        async fn modify_unit(
            &self,
            id: UnitId,
            mutation: Mutation<SandboxAllocationUnit>,
        ) -> Result<SandboxAllocationUnit> {
            self.0.modify_unit(id, mutation).await
        }
        async fn delete_unit(&self, id: UnitId) -> Result<()> {
            self.0.delete_unit(id).await
        }
        async fn insert_request(&self, request: Request) -> Result<()> {
            self.0.insert_request(request).await
        }
        async fn get_request(&self, id: RequestId) -> Result<Request> {
            self.0.get_request(id).await
        }
        async fn list_requests(&self) -> Result<Vec<Request>> {
            self.0.list_requests().await
        }
        async fn modify_request(&self, id: RequestId, mutation: Mutation<Request>) -> Result<Request> {
            self.0.modify_request(id, mutation).await
        }
        async fn insert_job(&self, _: Job) -> Result<()> {
            Err(Error::Store("disk full".to_string()))
        }
        async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
            self.0.get_job(id).await
        }
        async fn modify_job(&self, id: JobId, mutation: Mutation<Job>) -> Result<Option<Job>> {
            self.0.modify_job(id, mutation).await
        }
        async fn delete_job(&self, id: JobId) -> Result<bool> {
            self.0.delete_job(id).await
        }
        async fn list_jobs(&self, request: RequestId) -> Result<Vec<Job>> {
            self.0.list_jobs(request).await
        }
        async fn insert_lock(&self, lock: Lock) -> Result<()> {
            self.0.insert_lock(lock).await
        }
        async fn delete_lock(&self, id: LockId) -> Result<bool> {
            self.0.delete_lock(id).await
        }
        async fn list_locks(&self) -> Result<Vec<Lock>> {
            self.0.list_locks().await
        }
    }

    fn engine(store: Arc<dyn Store>) -> PipelineEngine {
        let executor = StageExecutor::new(
            StackProvisioner::new(Arc::new(Unreachable)),
            Arc::new(Unreachable),
            RunnerConfig::default(),
        );
        let barrier = BarrierConfig {
            poll_interval_ms: 10,
            poll_max_ms: 100,
            timeout_secs: 1,
            ..Default::default()
        };
        PipelineEngine::new(store, executor, CleanupReconciler::new(None), &barrier)
    }

    async fn seed_unit(store: &dyn Store) -> UnitId {
        let pool = Pool::new("lab", 2, StackDefinition::new("lab", "git://defs", "main"));
        let unit = SandboxAllocationUnit::new(pool.id);
        let unit_id = unit.id;
        store.insert_pool(pool).await.unwrap();
        store.insert_unit(unit).await.unwrap();
        unit_id
    }

    #[tokio::test]
    async fn request_that_cannot_be_stored_is_rolled_back() {
        let store = Arc::new(JoblessStore(MemoryStore::new()));
        let unit = seed_unit(store.as_ref()).await;
        let engine = engine(store.clone());

        let err = engine.start_request(unit, RequestKind::Allocation).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        assert!(store.list_locks().await.unwrap().is_empty());
        assert!(store.get_unit(unit).await.unwrap().allocation_request.is_none());
        let requests = store.list_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status(), RequestStatus::Failed);
        assert!(requests[0].finished_at.is_some());
        assert!(engine.inner.tokens.lock().unwrap().is_empty());

        // The unit is free for the next attempt.
        let err = engine.start_request(unit, RequestKind::Allocation).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn barrier_timeout_fails_the_waiting_stage_and_releases_the_unit() {
        let store = Arc::new(MemoryStore::new());
        let unit = seed_unit(store.as_ref()).await;
        let engine = engine(store.clone());
        let request_id = engine.start_request(unit, RequestKind::Allocation).await.unwrap();

        // Stage 0 reports success but its job is never unlocked.
        let first_job = store.get_request(request_id).await.unwrap().stages[0]
            .job_id
            .unwrap();
        let second_job = JobId::new();
        store
            .modify_request(
                request_id,
                Box::new(move |r: &mut Request| {
                    if let Some(stage) = r.stage_mut(0) {
                        stage.start();
                        stage.finish(StageOutput::default());
                    }
                    r.push_next_stage(second_job);
                    Ok(())
                }),
            )
            .await
            .unwrap();
        store
            .insert_job(Job::new(second_job, request_id, 1, Some(first_job)))
            .await
            .unwrap();

        engine.process_job(second_job).await.unwrap();

        let report = engine.get_request_status(request_id).await.unwrap();
        assert_eq!(report.status, RequestStatus::Failed);
        assert_eq!(report.stages[1].status, StageStatus::Failed);
        assert!(report.stages[1].error.as_deref().unwrap().contains("still locked"));
        assert!(report.finished_at.is_some());
        assert!(store.list_locks().await.unwrap().is_empty());
        assert!(store.list_jobs(request_id).await.unwrap().is_empty());
    }

    #[test]
    fn report_lists_stages_not_yet_created() {
        let mut request = Request::new(RequestKind::Cleanup, UnitId::new(), PoolId::new(), JobId::new());
        let report = RequestReport::from(&request);
        assert_eq!(report.status, RequestStatus::Pending);
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.remaining, vec![StageKind::Network, StageKind::Stack]);

        if let Some(stage) = request.stage_mut(0) {
            stage.start();
            stage.finish(StageOutput::default());
        }
        request.push_next_stage(JobId::new());
        let report = RequestReport::from(&request);
        assert_eq!(report.status, RequestStatus::Running);
        assert_eq!(report.remaining, vec![StageKind::Stack]);
    }

    #[test]
    fn report_serializes_statuses_uppercase() {
        let request = Request::new(RequestKind::Allocation, UnitId::new(), PoolId::new(), JobId::new());
        let json = serde_json::to_value(RequestReport::from(&request)).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["kind"], "allocation");
        assert_eq!(json["stages"][0]["kind"], "stack");
    }
}
