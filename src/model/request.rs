//! Allocation and cleanup requests and their stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, PoolId, RequestId, UnitId};

/// Which way a request moves a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Allocation,
    Cleanup,
}

impl RequestKind {
    /// Ordered stage list for this kind of request.
    ///
    /// Cleanup is the exact reverse of allocation: resources created later
    /// are torn down first.
    pub fn pipeline(&self) -> Vec<StageKind> {
        match self {
            RequestKind::Allocation => StageKind::ALLOCATION_ORDER.to_vec(),
            RequestKind::Cleanup => StageKind::ALLOCATION_ORDER.iter().rev().copied().collect(),
        }
    }
}

/// One step of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Provision (or destroy) the infrastructure stack.
    Stack,
    /// Configure (or unconfigure) sandbox networking.
    Network,
    /// Configure (or unconfigure) user-facing setup.
    UserConfig,
}

impl StageKind {
    /// Stage order for allocation requests.
    pub const ALLOCATION_ORDER: [StageKind; 3] =
        [StageKind::Stack, StageKind::Network, StageKind::UserConfig];

    /// Short name used in logs and execution-unit names.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Stack => "stack",
            StageKind::Network => "network",
            StageKind::UserConfig => "user-config",
        }
    }
}

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Finished | StageStatus::Failed)
    }
}

/// Aggregate status of a request, derived from its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Finished | RequestStatus::Failed)
    }
}

/// Free-form result of a stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    /// Structured result, e.g. the provisioned stack handle.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Captured log lines of the execution unit, if any.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Exit code of the execution unit, if any.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// A stage record inside a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub status: StageStatus,
    /// Job executing this stage; cleared once the request is terminal.
    pub job_id: Option<JobId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: StageOutput,
    pub error: Option<String>,
}

impl Stage {
    fn pending(kind: StageKind, job_id: JobId) -> Self {
        Self {
            kind,
            status: StageStatus::Pending,
            job_id: Some(job_id),
            started_at: None,
            finished_at: None,
            output: StageOutput::default(),
            error: None,
        }
    }

    /// Moves the stage to RUNNING.
    pub fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Moves the stage to FINISHED with the given output.
    pub fn finish(&mut self, output: StageOutput) {
        self.status = StageStatus::Finished;
        self.finished_at = Some(Utc::now());
        self.output = output;
    }

    /// Moves the stage to FAILED, keeping whatever output was captured.
    pub fn fail(&mut self, error: impl Into<String>, output: Option<StageOutput>) {
        self.status = StageStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
        if let Some(output) = output {
            self.output = output;
        }
    }
}

/// An allocation or cleanup request: an ordered run of stages.
///
/// Stages are created one at a time. A stage record only exists once its
/// predecessor has finished, so a failed stage is always the last one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub unit_id: UnitId,
    pub pool_id: PoolId,
    /// Declared stage order.
    pub plan: Vec<StageKind>,
    /// Stages created so far, in plan order.
    pub stages: Vec<Stage>,
    /// Set once a caller asked for cancellation.
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Creates a request whose first stage is pending on `first_job`.
    pub fn new(kind: RequestKind, unit_id: UnitId, pool_id: PoolId, first_job: JobId) -> Self {
        let plan = kind.pipeline();
        let stages = vec![Stage::pending(plan[0], first_job)];
        Self {
            id: RequestId::new(),
            kind,
            unit_id,
            pool_id,
            plan,
            stages,
            cancelled: false,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Aggregate status derived from the stage records.
    pub fn status(&self) -> RequestStatus {
        if self.stages.iter().any(|s| s.status == StageStatus::Failed) {
            RequestStatus::Failed
        } else if self.stages.len() == self.plan.len()
            && self.stages.iter().all(|s| s.status == StageStatus::Finished)
        {
            RequestStatus::Finished
        } else if self.stages.iter().all(|s| s.status == StageStatus::Pending) {
            RequestStatus::Pending
        } else {
            RequestStatus::Running
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Index and record of the most recently created stage.
    pub fn current_stage(&self) -> Option<(usize, &Stage)> {
        self.stages.iter().enumerate().last()
    }

    pub fn stage_mut(&mut self, index: usize) -> Option<&mut Stage> {
        self.stages.get_mut(index)
    }

    /// Creates the next pending stage once the current one has finished.
    ///
    /// Returns the new stage index, or `None` if the pipeline is complete,
    /// the current stage did not finish, or the request was cancelled.
    pub fn push_next_stage(&mut self, job_id: JobId) -> Option<usize> {
        if self.cancelled || self.stages.len() >= self.plan.len() {
            return None;
        }
        let (_, current) = self.current_stage()?;
        if current.status != StageStatus::Finished {
            return None;
        }
        let index = self.stages.len();
        self.stages.push(Stage::pending(self.plan[index], job_id));
        Some(index)
    }

    /// Output of the first stage of the given kind, if it finished.
    pub fn finished_output(&self, kind: StageKind) -> Option<&StageOutput> {
        self.stages
            .iter()
            .find(|s| s.kind == kind && s.status == StageStatus::Finished)
            .map(|s| &s.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: RequestKind) -> Request {
        Request::new(kind, UnitId::new(), PoolId::new(), JobId::new())
    }

    #[test]
    fn cleanup_pipeline_reverses_allocation() {
        let allocation = RequestKind::Allocation.pipeline();
        let mut cleanup = RequestKind::Cleanup.pipeline();
        cleanup.reverse();
        assert_eq!(allocation, cleanup);
        assert_eq!(
            RequestKind::Cleanup.pipeline(),
            vec![StageKind::UserConfig, StageKind::Network, StageKind::Stack]
        );
    }

    #[test]
    fn new_request_has_one_pending_stage() {
        let req = request(RequestKind::Allocation);
        assert_eq!(req.stages.len(), 1);
        assert_eq!(req.stages[0].kind, StageKind::Stack);
        assert_eq!(req.status(), RequestStatus::Pending);
    }

    #[test]
    fn status_follows_stages() {
        let mut req = request(RequestKind::Allocation);
        req.stages[0].start();
        assert_eq!(req.status(), RequestStatus::Running);

        req.stages[0].finish(StageOutput::default());
        assert_eq!(req.status(), RequestStatus::Running);

        for _ in 1..req.plan.len() {
            let idx = req.push_next_stage(JobId::new()).unwrap();
            req.stages[idx].start();
            req.stages[idx].finish(StageOutput::default());
        }
        assert_eq!(req.status(), RequestStatus::Finished);
        assert!(req.push_next_stage(JobId::new()).is_none());
    }

    #[test]
    fn failed_stage_fails_request_and_blocks_next() {
        let mut req = request(RequestKind::Cleanup);
        req.stages[0].start();
        req.stages[0].fail("boom", None);
        assert_eq!(req.status(), RequestStatus::Failed);
        assert!(req.push_next_stage(JobId::new()).is_none());
        assert_eq!(req.stages.len(), 1);
    }

    #[test]
    fn cancelled_request_creates_no_more_stages() {
        let mut req = request(RequestKind::Allocation);
        req.stages[0].start();
        req.stages[0].finish(StageOutput::default());
        req.cancelled = true;
        assert!(req.push_next_stage(JobId::new()).is_none());
    }

    #[test]
    fn stage_status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&StageStatus::Finished).unwrap(),
            "\"FINISHED\""
        );
        assert_eq!(
            serde_json::to_string(&RequestStatus::Pending).unwrap(),
            "\"PENDING\""
        );
    }
}
