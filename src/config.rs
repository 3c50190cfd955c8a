//! Orchestrator configuration and its validation.
//!
//! Loaded from a TOML file. Every section has defaults, so an empty file is
//! a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::queue::TimeoutPolicy;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers pulling stage jobs.
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { count: 4 }
    }
}

/// Job synchronization barrier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// First poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Poll interval cap in milliseconds.
    pub poll_max_ms: u64,
    /// How long a stage waits on its predecessor.
    pub timeout_secs: u64,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            poll_max_ms: 5000,
            timeout_secs: 3600,
            timeout_policy: TimeoutPolicy::Fatal,
        }
    }
}

impl BarrierConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Execution runner settings for configuration stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Container CLI used to run execution units.
    pub program: String,
    /// Arguments placed before every subcommand (e.g. `--context`).
    pub base_args: Vec<String>,
    /// Image the configuration runner executes.
    pub image: String,
    /// Scratch directory for rendered inventories.
    pub work_dir: PathBuf,
    /// Credential material mounted read-only into every unit.
    pub credentials_dir: PathBuf,
    /// Playbook run by network stages.
    pub network_playbook: String,
    /// Playbook run by user configuration stages.
    pub user_playbook: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            base_args: Vec::new(),
            image: "sandbox-configurator:latest".to_string(),
            work_dir: std::env::temp_dir().join("sandbox-allocator").join("runs"),
            credentials_dir: PathBuf::from("/etc/sandbox-allocator/credentials"),
            network_playbook: "network.yml".to_string(),
            user_playbook: "user.yml".to_string(),
        }
    }
}

/// Stack provisioner CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub program: String,
    pub base_args: Vec<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            program: "stackctl".to_string(),
            base_args: Vec::new(),
        }
    }
}

/// Intermediary access host holding per-unit credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessHostConfig {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Directory on the host holding one credential file per unit.
    #[serde(default = "default_credential_dir")]
    pub credential_dir: String,
    /// SSH client binary.
    #[serde(default = "default_ssh_program")]
    pub program: String,
}

fn default_credential_dir() -> String {
    "/home/sandbox/.ssh/units".to_string()
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub barrier: BarrierConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
    #[serde(default)]
    pub access_host: Option<AccessHostConfig>,
}

impl Config {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid configuration: {}", e)))
    }

    /// Loads a configuration file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = ?path, "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

impl Validate for WorkerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        if self.count == 0 {
            result.add_error("workers.count must be at least 1");
        }
        if self.count > 64 {
            result.add_warning("workers.count over 64 may overload the execution backend");
        }
        result
    }
}

impl Validate for BarrierConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        if self.poll_interval_ms == 0 {
            result.add_error("barrier.poll_interval_ms must be greater than 0");
        }
        if self.timeout_secs == 0 {
            result.add_error("barrier.timeout_secs must be greater than 0");
        }
        if self.poll_max_ms < self.poll_interval_ms {
            result.add_warning("barrier.poll_max_ms is below poll_interval_ms and will be raised");
        }
        if self.timeout_policy == TimeoutPolicy::Advisory {
            result.add_warning(
                "barrier.timeout_policy = advisory lets stages run before their predecessor finished",
            );
        }
        result
    }
}

impl Validate for RunnerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        if self.program.trim().is_empty() {
            result.add_error("runner.program cannot be empty");
        }
        if self.image.trim().is_empty() {
            result.add_error("runner.image cannot be empty");
        }
        if !self.credentials_dir.is_absolute() {
            result.add_warning(format!(
                "runner.credentials_dir '{}' is relative; container mounts need absolute paths",
                self.credentials_dir.display()
            ));
        }
        result
    }
}

impl Validate for ProvisionerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        if self.program.trim().is_empty() {
            result.add_error("provisioner.program cannot be empty");
        }
        result
    }
}

impl Validate for AccessHostConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        if self.host.trim().is_empty() {
            result.add_error("access_host.host cannot be empty");
        }
        if self.user.trim().is_empty() {
            result.add_error("access_host.user cannot be empty");
        }
        if self.identity_file.is_none() {
            result.add_warning("access_host.identity_file not set, relying on the ssh agent");
        }
        result
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.workers.validate());
        result.merge(self.barrier.validate());
        result.merge(self.runner.validate());
        result.merge(self.provisioner.validate());
        if let Some(access_host) = &self.access_host {
            result.merge(access_host.validate());
        }
        result
    }
}
