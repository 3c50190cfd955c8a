//! Cross-job synchronization on top of the job store.
//!
//! The queue has no native "wait for another job" primitive. A dependent job
//! polls the `locked` flag in its predecessor's metadata until the
//! predecessor clears it. A job that no longer exists counts as unlocked:
//! jobs are only deleted once their request is terminal or cancelled.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backoff::ExponentialBackoff;
use crate::config::BarrierConfig;
use crate::error::{Error, Result};
use crate::model::JobId;
use crate::store::Store;

use super::Job;

/// What happens when a dependent job is still locked at the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// The waiting stage fails with `BarrierTimeout`.
    #[default]
    Fatal,
    /// The timeout is logged and the waiting stage proceeds.
    Advisory,
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// The awaited job signalled unlock (or is gone).
    Unlocked,
    /// The timeout elapsed under [`TimeoutPolicy::Advisory`].
    TimedOut,
}

/// Polling wait/signal primitive over job metadata.
#[derive(Clone)]
pub struct JobBarrier {
    store: Arc<dyn Store>,
    poll_interval: Duration,
    poll_max: Duration,
    timeout: Duration,
    policy: TimeoutPolicy,
}

impl JobBarrier {
    pub fn new(store: Arc<dyn Store>, config: &BarrierConfig) -> Self {
        Self {
            store,
            poll_interval: config.poll_interval(),
            poll_max: config.poll_max(),
            timeout: config.timeout(),
            policy: config.timeout_policy,
        }
    }

    /// Waits on `job` with the configured timeout and poll interval.
    pub async fn wait(&self, job: JobId) -> Result<BarrierOutcome> {
        self.wait_until_unlocked(job, self.timeout, self.poll_interval)
            .await
    }

    /// Polls `job` every `poll_interval` (backing off up to the configured
    /// maximum) until its `locked` flag is cleared or `timeout` elapses.
    pub async fn wait_until_unlocked(
        &self,
        job: JobId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<BarrierOutcome> {
        let start = Instant::now();
        let mut backoff = ExponentialBackoff::new(poll_interval, self.poll_max);

        loop {
            match self.store.get_job(job).await? {
                Some(j) if j.is_locked() => {}
                _ => return Ok(BarrierOutcome::Unlocked),
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return match self.policy {
                    TimeoutPolicy::Fatal => {
                        tracing::error!(job_id = %job, waited = ?waited, "barrier timed out");
                        Err(Error::BarrierTimeout { job, waited })
                    }
                    TimeoutPolicy::Advisory => {
                        tracing::warn!(
                            job_id = %job,
                            waited = ?waited,
                            "barrier timed out, proceeding without unlock signal"
                        );
                        Ok(BarrierOutcome::TimedOut)
                    }
                };
            }

            tokio::time::sleep(backoff.current().min(timeout - waited)).await;
            backoff.next();
        }
    }

    /// Clears the `locked` flag of `job`. Idempotent; a missing job is fine.
    pub async fn signal_unlock(&self, job: JobId) -> Result<()> {
        let updated = self
            .store
            .modify_job(
                job,
                Box::new(|j: &mut Job| {
                    j.unlock();
                    Ok(())
                }),
            )
            .await?;
        if updated.is_none() {
            tracing::debug!(job_id = %job, "unlock signalled for job that no longer exists");
        }
        Ok(())
    }
}
