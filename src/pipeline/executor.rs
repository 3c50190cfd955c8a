//! Per-stage work: stack provisioning and configuration runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::model::{Pool, RequestId, RequestKind, SandboxAllocationUnit, StageKind, StageOutput};
use crate::provisioner::{StackHandle, StackProvisioner};
use crate::runner::{ExecutionBackend, Mount, RunSpec};

/// How long a terminated unit gets to exit before its handle is dropped.
const TERMINATE_GRACE: Duration = Duration::from_secs(30);

const CREDENTIALS_TARGET: &str = "/credentials";
const INVENTORY_TARGET: &str = "/inventory";
const INVENTORY_FILE: &str = "inventory.yml";

/// Everything a stage needs to do its work.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub request_id: RequestId,
    pub kind: RequestKind,
    pub stage: StageKind,
    pub unit: SandboxAllocationUnit,
    pub pool: Pool,
    /// Stack the configuration stages run against, if known.
    pub stack: Option<StackHandle>,
}

/// A failed stage, with whatever output was captured before the failure.
#[derive(Debug)]
pub struct StageFailure {
    pub error: Error,
    pub output: Option<StageOutput>,
}

impl From<Error> for StageFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            output: None,
        }
    }
}

/// Ansible-style inventory handed to configuration runs.
#[derive(Debug, Serialize)]
struct Inventory {
    all: InventoryGroup,
}

#[derive(Debug, Serialize)]
struct InventoryGroup {
    hosts: BTreeMap<String, InventoryHost>,
    vars: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct InventoryHost {
    ansible_host: String,
}

impl Inventory {
    fn render(ctx: &StageContext, stack: &StackHandle) -> Result<String> {
        let hosts = stack
            .nodes
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    InventoryHost {
                        ansible_host: n.address.clone(),
                    },
                )
            })
            .collect();

        let mut vars = BTreeMap::new();
        vars.insert("sandbox_unit".to_string(), serde_json::json!(ctx.unit.id));
        vars.insert("sandbox_pool".to_string(), serde_json::json!(ctx.pool.name));
        vars.insert("stack_name".to_string(), serde_json::json!(stack.name));
        vars.insert("stack_outputs".to_string(), serde_json::json!(stack.outputs));

        let inventory = Inventory {
            all: InventoryGroup { hosts, vars },
        };
        serde_yaml::to_string(&inventory)
            .map_err(|e| Error::Configuration(format!("failed to render inventory: {}", e)))
    }
}

/// Runs the work of a single stage.
#[derive(Clone)]
pub struct StageExecutor {
    provisioner: StackProvisioner,
    runner: Arc<dyn ExecutionBackend>,
    config: RunnerConfig,
}

impl StageExecutor {
    pub fn new(
        provisioner: StackProvisioner,
        runner: Arc<dyn ExecutionBackend>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            provisioner,
            runner,
            config,
        }
    }

    /// Executes the stage described by `ctx` until it ends or `cancel` fires.
    pub async fn execute(
        &self,
        ctx: &StageContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<StageOutput, StageFailure> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(ctx.request_id).into());
        }
        match ctx.stage {
            StageKind::Stack => self.stack_stage(ctx, cancel).await,
            StageKind::Network | StageKind::UserConfig => self.configuration_stage(ctx, cancel).await,
        }
    }

    async fn stack_stage(
        &self,
        ctx: &StageContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<StageOutput, StageFailure> {
        let name = ctx.unit.stack_name();
        let work = self.stack_work(ctx, &name);

        tokio::select! {
            result = work => result.map_err(StageFailure::from),
            _ = cancel.cancelled() => {
                tracing::warn!(request_id = %ctx.request_id, stack = %name, "stack stage cancelled");
                if ctx.kind == RequestKind::Allocation {
                    // The interrupted create may have left a partial stack.
                    if let Err(e) = self.provisioner.destroy_stack(&name).await {
                        tracing::warn!(request_id = %ctx.request_id, stack = %name, error = %e, "could not destroy cancelled stack");
                    }
                }
                Err(Error::Cancelled(ctx.request_id).into())
            }
        }
    }

    async fn stack_work(&self, ctx: &StageContext, name: &str) -> Result<StageOutput> {
        match ctx.kind {
            RequestKind::Allocation => {
                let handle = self.provisioner.create_stack(name, &ctx.pool.definition).await?;
                Ok(StageOutput {
                    data: serde_json::to_value(&handle)?,
                    ..Default::default()
                })
            }
            RequestKind::Cleanup => {
                self.provisioner.destroy_stack(name).await?;
                Ok(StageOutput {
                    data: serde_json::json!({ "destroyed": name }),
                    ..Default::default()
                })
            }
        }
    }

    fn playbook(&self, stage: StageKind) -> &str {
        match stage {
            StageKind::Network => &self.config.network_playbook,
            _ => &self.config.user_playbook,
        }
    }

    async fn configuration_stage(
        &self,
        ctx: &StageContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<StageOutput, StageFailure> {
        let Some(stack) = &ctx.stack else {
            return match ctx.kind {
                // A stack that was never recorded was never configured either.
                RequestKind::Cleanup => Ok(StageOutput {
                    logs: vec!["no stack handle recorded, nothing to unconfigure".to_string()],
                    ..Default::default()
                }),
                RequestKind::Allocation => Err(Error::InvalidState(format!(
                    "no stack handle for {} stage of request {}",
                    ctx.stage.as_str(),
                    ctx.request_id
                ))
                .into()),
            };
        };

        let inventory_dir = self
            .config
            .work_dir
            .join(ctx.request_id.to_string())
            .join(ctx.stage.as_str());
        let result = self.run_configuration(ctx, stack, &inventory_dir, cancel).await;

        if let Err(e) = tokio::fs::remove_dir_all(&inventory_dir).await {
            tracing::debug!(path = ?inventory_dir, error = %e, "failed to remove inventory directory");
        }
        result
    }

    async fn run_configuration(
        &self,
        ctx: &StageContext,
        stack: &StackHandle,
        inventory_dir: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<StageOutput, StageFailure> {
        tokio::fs::create_dir_all(inventory_dir).await.map_err(Error::from)?;
        let inventory = Inventory::render(ctx, stack)?;
        tokio::fs::write(inventory_dir.join(INVENTORY_FILE), inventory)
            .await
            .map_err(Error::from)?;

        let spec = self.run_spec(ctx, inventory_dir);
        let run = self.runner.start(spec).await?;

        tracing::info!(
            request_id = %ctx.request_id,
            stage = ctx.stage.as_str(),
            unit = %run.name(),
            "configuration run started"
        );

        tokio::select! {
            status = run.wait() => {
                let status = status?;
                let output = StageOutput {
                    data: serde_json::json!({ "unit": run.name() }),
                    logs: run.log_lines(),
                    exit_code: status.code,
                };
                if status.success() {
                    Ok(output)
                } else {
                    Err(StageFailure {
                        error: Error::Configuration(format!(
                            "{} exited with {}",
                            self.playbook(ctx.stage),
                            status.code.map_or_else(|| "a signal".to_string(), |c| format!("code {}", c))
                        )),
                        output: Some(output),
                    })
                }
            }
            _ = cancel.cancelled() => {
                if let Err(e) = run.terminate().await {
                    tracing::warn!(unit = %run.name(), error = %e, "failed to terminate unit");
                }
                let exit_code = match tokio::time::timeout(TERMINATE_GRACE, run.wait()).await {
                    Ok(Ok(status)) => status.code,
                    _ => None,
                };
                Err(StageFailure {
                    error: Error::Cancelled(ctx.request_id),
                    output: Some(StageOutput {
                        data: serde_json::json!({ "unit": run.name() }),
                        logs: run.log_lines(),
                        exit_code,
                    }),
                })
            }
        }
    }

    fn run_spec(&self, ctx: &StageContext, inventory_dir: &Path) -> RunSpec {
        let request = ctx.request_id.to_string();
        let unit = ctx.unit.id.to_string();
        let mode = match ctx.kind {
            RequestKind::Allocation => "allocate",
            RequestKind::Cleanup => "cleanup",
        };

        let mut env = BTreeMap::new();
        env.insert("SANDBOX_UNIT".to_string(), unit.clone());
        env.insert("SANDBOX_POOL".to_string(), ctx.pool.id.to_string());
        env.insert("SANDBOX_STAGE".to_string(), ctx.stage.as_str().to_string());
        env.insert("SANDBOX_MODE".to_string(), mode.to_string());

        RunSpec {
            name: format!("{}-{}-{}", ctx.stage.as_str(), &unit[..8], &request[..8]),
            image: self.config.image.clone(),
            command: vec![
                "--inventory".to_string(),
                format!("{}/{}", INVENTORY_TARGET, INVENTORY_FILE),
                "--playbook".to_string(),
                self.playbook(ctx.stage).to_string(),
                "--mode".to_string(),
                mode.to_string(),
            ],
            env,
            mounts: vec![
                Mount::read_only(&self.config.credentials_dir, CREDENTIALS_TARGET),
                Mount::read_only(inventory_dir, INVENTORY_TARGET),
            ],
        }
    }
}
