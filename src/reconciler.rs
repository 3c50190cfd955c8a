//! Best-effort teardown of state living outside the sandbox itself.
//!
//! Today that is the per-unit credential left on the access host. Failures
//! are logged and swallowed: a stale credential must never turn a finished
//! cleanup into a failed one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::AccessHostConfig;
use crate::error::{Error, Result};
use crate::model::UnitId;

/// Removes the access-host credential of one unit.
#[async_trait]
pub trait CredentialRemover: Send + Sync {
    async fn remove_credentials(&self, unit: UnitId) -> Result<()>;
}

/// Removes credentials by running `rm -f` on the access host over SSH.
pub struct SshCredentialRemover {
    config: AccessHostConfig,
}

impl SshCredentialRemover {
    pub fn new(config: AccessHostConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, unit: UnitId) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}", self.config.user, self.config.host));
        args.push("rm".to_string());
        args.push("-f".to_string());
        args.push(format!(
            "{}/{}",
            self.config.credential_dir.trim_end_matches('/'),
            unit
        ));
        args
    }
}

#[async_trait]
impl CredentialRemover for SshCredentialRemover {
    async fn remove_credentials(&self, unit: UnitId) -> Result<()> {
        let output = Command::new(&self.config.program)
            .args(self.build_args(unit))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::AncillaryCleanup(format!("failed to run {}: {}", self.config.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::AncillaryCleanup(format!(
                "credential removal on {} failed: {}",
                self.config.host,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Runs best-effort cleanup after a unit's cleanup request finished.
#[derive(Clone, Default)]
pub struct CleanupReconciler {
    remover: Option<Arc<dyn CredentialRemover>>,
}

impl CleanupReconciler {
    pub fn new(remover: Option<Arc<dyn CredentialRemover>>) -> Self {
        Self { remover }
    }

    /// Removes ancillary state of `unit`. Never fails.
    pub async fn reconcile(&self, unit: UnitId) {
        let Some(remover) = &self.remover else {
            tracing::debug!(unit_id = %unit, "no access host configured, nothing to reconcile");
            return;
        };
        match remover.remove_credentials(unit).await {
            Ok(()) => tracing::info!(unit_id = %unit, "removed access-host credentials"),
            Err(e) => tracing::warn!(unit_id = %unit, error = %e, "ancillary cleanup failed"),
        }
    }
}
