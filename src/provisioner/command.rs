//! Provisioner backend that drives a stack CLI.
//!
//! Every call is one CLI invocation. Commands that return data are run with
//! `--output json` and their stdout is parsed.

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ProvisionerConfig;
use crate::error::{Error, Result};
use crate::model::StackDefinition;

use super::{ImageRef, NodeAction, ProvisionerBackend, StackHandle};

/// Backend invoking an external provisioning CLI.
pub struct CommandBackend {
    /// Path to the CLI binary.
    cli_path: String,
    /// Arguments placed before every subcommand.
    base_args: Vec<String>,
}

impl CommandBackend {
    pub fn new(config: &ProvisionerConfig) -> Self {
        Self {
            cli_path: config.program.clone(),
            base_args: config.base_args.clone(),
        }
    }

    /// Creates a backend with a custom CLI path and no base arguments.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            base_args: Vec::new(),
        }
    }

    fn create_args(name: &str, definition: &StackDefinition) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--source".to_string(),
            definition.source.clone(),
            "--revision".to_string(),
            definition.revision.clone(),
        ];
        for (key, value) in &definition.variables {
            args.push("--var".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("--output".to_string());
        args.push("json".to_string());
        args
    }

    /// Runs the CLI and returns stdout, failing on a non-zero exit.
    ///
    /// Dropping the returned future kills the CLI.
    async fn run(&self, args: &[String]) -> Result<String> {
        let subcommand = args.first().map(String::as_str).unwrap_or("");
        tracing::debug!(cli = %self.cli_path, args = ?args, "running provisioner CLI");

        let output = Command::new(&self.cli_path)
            .args(&self.base_args)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Provision(format!("failed to run {}: {}", self.cli_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Provision(format!(
                "{} {} failed: {}",
                self.cli_path,
                subcommand,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProvisionerBackend for CommandBackend {
    async fn create(&self, name: &str, definition: &StackDefinition) -> Result<StackHandle> {
        let stdout = self.run(&Self::create_args(name, definition)).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| Error::Provision(format!("failed to parse stack handle: {}", e)))
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.run(&[
            "destroy".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--ignore-missing".to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn fetch_images(&self) -> Result<Vec<ImageRef>> {
        let stdout = self
            .run(&["images".to_string(), "--output".to_string(), "json".to_string()])
            .await?;
        serde_json::from_str(&stdout)
            .map_err(|e| Error::Provision(format!("failed to parse image list: {}", e)))
    }

    async fn node_action(&self, stack: &str, node: &str, action: NodeAction) -> Result<()> {
        self.run(&[
            "node".to_string(),
            action.as_str().to_string(),
            "--stack".to_string(),
            stack.to_string(),
            "--node".to_string(),
            node.to_string(),
        ])
        .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.cli_path
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Writes a fake CLI script and returns a backend running it via `sh`.
    fn fake_cli(dir: &TempDir, body: &str) -> CommandBackend {
        let script = dir.path().join("stackctl.sh");
        std::fs::write(&script, body).unwrap();
        CommandBackend {
            cli_path: "sh".to_string(),
            base_args: vec![script.to_string_lossy().into_owned()],
        }
    }

    #[test]
    fn create_args_carry_variables() {
        let mut definition = StackDefinition::new("lab", "git://defs", "v3");
        definition.variables.insert("flavor".to_string(), "small".to_string());
        let args = CommandBackend::create_args("pool-a-sandbox-b", &definition);
        assert_eq!(&args[..3], &["create", "--name", "pool-a-sandbox-b"]);
        assert!(args.windows(2).any(|w| w[0] == "--var" && w[1] == "flavor=small"));
        assert_eq!(args.last().map(String::as_str), Some("json"));
    }

    #[tokio::test]
    async fn create_parses_handle_from_stdout() {
        let dir = TempDir::new().unwrap();
        let backend = fake_cli(
            &dir,
            r#"echo '{"name":"'"$3"'","nodes":[{"name":"web","address":"10.1.0.5"}]}'"#,
        );
        let handle = backend
            .create("stack-1", &StackDefinition::new("lab", "src", "main"))
            .await
            .unwrap();
        assert_eq!(handle.name, "stack-1");
        assert_eq!(handle.node("web").unwrap().address, "10.1.0.5");
    }

    #[tokio::test]
    async fn failing_cli_is_a_provision_error() {
        let dir = TempDir::new().unwrap();
        let backend = fake_cli(&dir, "echo 'quota exceeded' >&2\nexit 3\n");
        let err = backend.destroy("stack-1").await.unwrap_err();
        match err {
            Error::Provision(msg) => assert!(msg.contains("quota exceeded")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn images_are_parsed() {
        let dir = TempDir::new().unwrap();
        let backend = fake_cli(&dir, r#"echo '[{"id":"i-1","name":"debian"}]'"#);
        let images = backend.fetch_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].name, "debian");
    }

    #[tokio::test]
    async fn abandoned_create_does_not_finish_in_the_background() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("created");
        let backend = fake_cli(&dir, "sleep 1\ntouch \"$(dirname \"$0\")/created\"\n");

        let definition = StackDefinition::new("lab", "src", "main");
        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            backend.create("stack-1", &definition),
        )
        .await;
        assert!(attempt.is_err());

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let backend = CommandBackend::with_cli_path("/nonexistent/stackctl");
        assert!(matches!(
            backend.fetch_images().await,
            Err(Error::Provision(_))
        ));
    }
}
