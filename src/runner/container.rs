//! Execution backend driving a container CLI (`docker`, `podman`, ...).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::watch;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};

use super::{ExecutionBackend, ExecutionUnit, ExitStatus, LogBuffer, RunHandle, RunSpec};

/// Runs each unit as an attached `run` of the container CLI.
pub struct ContainerCliBackend {
    /// Path to the container CLI binary.
    cli_path: String,
    /// Arguments placed before every subcommand.
    base_args: Vec<String>,
}

impl ContainerCliBackend {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            cli_path: config.program.clone(),
            base_args: config.base_args.clone(),
        }
    }

    /// Creates a backend with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            base_args: Vec::new(),
        }
    }

    /// Builds the arguments of the `run` subcommand.
    fn build_args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--name".to_string(), spec.name.clone()];

        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("--volume".to_string());
            args.push(volume);
        }

        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ExecutionBackend for ContainerCliBackend {
    async fn start(&self, spec: RunSpec) -> Result<RunHandle> {
        let args = Self::build_args(&spec);

        tracing::info!(
            cli = %self.cli_path,
            unit = %spec.name,
            image = %spec.image,
            "starting execution unit"
        );

        let mut child = Command::new(&self.cli_path)
            .args(&self.base_args)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::RunnerUnavailable(format!("failed to spawn {}: {}", self.cli_path, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::RunnerUnavailable("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::RunnerUnavailable("stderr was not captured".to_string()))?;

        let logs = LogBuffer::new();
        let (status_tx, status_rx) = watch::channel(None);

        let writer = logs.clone();
        let unit_name = spec.name.clone();
        tokio::spawn(async move {
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();
            let mut stdout_done = false;
            let mut stderr_done = false;

            // Process stdout and stderr concurrently
            while !(stdout_done && stderr_done) {
                tokio::select! {
                    line = stdout_reader.next_line(), if !stdout_done => match line {
                        Ok(Some(line)) => {
                            tracing::debug!(unit = %unit_name, line = %line, "unit stdout");
                            writer.push(line);
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            tracing::error!(unit = %unit_name, error = %e, "error reading stdout");
                            stdout_done = true;
                        }
                    },
                    line = stderr_reader.next_line(), if !stderr_done => match line {
                        Ok(Some(line)) => {
                            tracing::debug!(unit = %unit_name, line = %line, "unit stderr");
                            writer.push(line);
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            tracing::error!(unit = %unit_name, error = %e, "error reading stderr");
                            stderr_done = true;
                        }
                    },
                }
            }

            let status = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    tracing::error!(unit = %unit_name, error = %e, "failed to wait for unit");
                    ExitStatus { code: None }
                }
            };
            writer.close();
            let _ = status_tx.send(Some(status));
        });

        let unit = ContainerUnit {
            cli_path: self.cli_path.clone(),
            base_args: self.base_args.clone(),
            name: spec.name.clone(),
            status: status_rx,
        };
        Ok(RunHandle::new(spec.name, logs, Box::new(unit)))
    }

    fn name(&self) -> &str {
        &self.cli_path
    }
}

/// One container started by [`ContainerCliBackend`].
struct ContainerUnit {
    cli_path: String,
    base_args: Vec<String>,
    name: String,
    status: watch::Receiver<Option<ExitStatus>>,
}

impl ContainerUnit {
    async fn run_cli(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.cli_path)
            .args(&self.base_args)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::RunnerUnavailable(format!("failed to run {}: {}", self.cli_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::RunnerUnavailable(format!(
                "{} {} failed: {}",
                self.cli_path,
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn remove_now(&self) {
        let result = std::process::Command::new(&self.cli_path)
            .args(&self.base_args)
            .args(["rm", "--force", self.name.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::error!(unit = %self.name, code = ?status.code(), "failed to remove unit on drop");
            }
            Err(e) => {
                tracing::error!(unit = %self.name, error = %e, "failed to remove unit on drop");
            }
        }
    }
}

#[async_trait]
impl ExecutionUnit for ContainerUnit {
    async fn wait(&self) -> Result<ExitStatus> {
        let mut status = self.status.clone();
        let code = *status
            .wait_for(|s| s.is_some())
            .await
            .map_err(|_| Error::RunnerUnavailable(format!("lost track of unit {}", self.name)))?;
        code.ok_or_else(|| Error::RunnerUnavailable(format!("unit {} reported no status", self.name)))
    }

    async fn terminate(&self) -> Result<()> {
        self.run_cli(&["kill", self.name.as_str()]).await
    }

    async fn remove(&self) -> Result<()> {
        tracing::debug!(unit = %self.name, "removing execution unit");
        self.run_cli(&["rm", "--force", self.name.as_str()]).await
    }

    /// On a multi-threaded runtime the worker hands its other tasks off
    /// while the CLI runs.
    fn remove_blocking(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.remove_now())
            }
            _ => self.remove_now(),
        }
    }
}
