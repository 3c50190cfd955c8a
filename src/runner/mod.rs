//! Execution runner for configuration stages.
//!
//! A stage that configures a sandbox runs as an isolated execution unit
//! (a container). Units stream their output into a [`LogBuffer`] and are
//! always removed once finished, cancelled, or dropped.

mod container;
mod logs;

pub use container::ContainerCliBackend;
pub use logs::{LogBuffer, LogCursor};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::Result;

/// A host path made visible inside the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// Everything needed to start one execution unit.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Unique unit name; also used to remove it.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
}

/// How a unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, `None` if the unit was killed by a signal.
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A started unit as seen by its backend.
#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    /// Waits until the unit exits.
    async fn wait(&self) -> Result<ExitStatus>;

    /// Stops the unit; a pending [`ExecutionUnit::wait`] then returns.
    async fn terminate(&self) -> Result<()>;

    /// Removes the stopped unit and its resources.
    async fn remove(&self) -> Result<()>;

    /// Synchronous removal, used from `Drop`.
    fn remove_blocking(&self);
}

/// Starts execution units.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Starts `spec`. Fails with `RunnerUnavailable` if the unit could not
    /// be started at all.
    async fn start(&self, spec: RunSpec) -> Result<RunHandle>;

    /// Returns the name of this backend.
    fn name(&self) -> &str;
}

/// Owned handle of a running unit.
///
/// Dropping the handle removes the unit if nobody did so yet.
pub struct RunHandle {
    name: String,
    logs: LogBuffer,
    unit: Box<dyn ExecutionUnit>,
    removed: AtomicBool,
}

impl RunHandle {
    pub fn new(name: impl Into<String>, logs: LogBuffer, unit: Box<dyn ExecutionUnit>) -> Self {
        Self {
            name: name.into(),
            logs,
            unit,
            removed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A log reader starting from the first line.
    pub fn logs(&self) -> LogCursor {
        self.logs.cursor()
    }

    /// Lines captured so far.
    pub fn log_lines(&self) -> Vec<String> {
        self.logs.lines()
    }

    /// Waits for the unit to exit, then removes it.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let status = self.unit.wait().await?;
        if let Err(e) = self.remove().await {
            tracing::warn!(unit = %self.name, error = %e, "failed to remove finished unit");
        }
        Ok(status)
    }

    pub async fn terminate(&self) -> Result<()> {
        tracing::info!(unit = %self.name, "terminating execution unit");
        self.unit.terminate().await
    }

    /// Removes the unit. Only the first call does anything.
    pub async fn remove(&self) -> Result<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.unit.remove().await
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.removed.swap(true, Ordering::SeqCst) {
            tracing::debug!(unit = %self.name, "removing execution unit on drop");
            self.unit.remove_blocking();
        }
    }
}
