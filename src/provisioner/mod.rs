//! Stack provisioning, image listing and node actions.
//!
//! The orchestrator never talks to infrastructure directly. A
//! [`ProvisionerBackend`] creates and destroys named stacks; the
//! [`StackProvisioner`] wraps it with the image cache and action parsing.

mod command;

pub use command::CommandBackend;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::StackDefinition;

/// One addressable machine of a provisioned stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackNode {
    pub name: String,
    /// Management address the configuration runner connects to.
    pub address: String,
}

/// Handle of a provisioned stack, as reported by the provisioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackHandle {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<StackNode>,
    /// Provisioner-specific outputs, passed on to configuration stages.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl StackHandle {
    pub fn node(&self, name: &str) -> Option<&StackNode> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// A machine image the provisioner can build nodes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Power action on a single node of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAction {
    Suspend,
    Resume,
    Reboot,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Suspend => "suspend",
            NodeAction::Resume => "resume",
            NodeAction::Reboot => "reboot",
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suspend" => Ok(NodeAction::Suspend),
            "resume" => Ok(NodeAction::Resume),
            "reboot" => Ok(NodeAction::Reboot),
            other => Err(Error::Validation(format!(
                "unknown node action '{}', expected suspend, resume or reboot",
                other
            ))),
        }
    }
}

/// Infrastructure backend that owns stacks.
#[async_trait]
pub trait ProvisionerBackend: Send + Sync {
    /// Creates the stack `name` from `definition` and returns its handle.
    async fn create(&self, name: &str, definition: &StackDefinition) -> Result<StackHandle>;

    /// Destroys the stack `name`. Destroying a stack that does not exist
    /// succeeds.
    async fn destroy(&self, name: &str) -> Result<()>;

    /// Lists the images available to new stacks.
    async fn fetch_images(&self) -> Result<Vec<ImageRef>>;

    /// Applies a power action to one node.
    async fn node_action(&self, stack: &str, node: &str, action: NodeAction) -> Result<()>;

    /// Returns the name of this backend.
    fn name(&self) -> &str;
}

/// Provisioner facade with a process-wide image cache.
#[derive(Clone)]
pub struct StackProvisioner {
    backend: Arc<dyn ProvisionerBackend>,
    images: Arc<RwLock<Option<Vec<ImageRef>>>>,
}

impl StackProvisioner {
    pub fn new(backend: Arc<dyn ProvisionerBackend>) -> Self {
        Self {
            backend,
            images: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn create_stack(&self, name: &str, definition: &StackDefinition) -> Result<StackHandle> {
        tracing::info!(
            backend = %self.backend.name(),
            stack = %name,
            definition = %definition.name,
            revision = %definition.revision,
            "creating stack"
        );
        let handle = self.backend.create(name, definition).await?;
        tracing::info!(stack = %name, nodes = handle.nodes.len(), "stack created");
        Ok(handle)
    }

    pub async fn destroy_stack(&self, name: &str) -> Result<()> {
        tracing::info!(backend = %self.backend.name(), stack = %name, "destroying stack");
        self.backend.destroy(name).await
    }

    /// Lists images, served from the cache unless `use_cache` is false or
    /// the cache is empty. A fetch always refreshes the cache.
    pub async fn list_available_images(&self, use_cache: bool) -> Result<Vec<ImageRef>> {
        if use_cache {
            if let Some(images) = self.images.read().await.as_ref() {
                tracing::debug!(count = images.len(), "serving images from cache");
                return Ok(images.clone());
            }
        }

        let images = self.backend.fetch_images().await?;
        *self.images.write().await = Some(images.clone());
        tracing::debug!(count = images.len(), "image cache refreshed");
        Ok(images)
    }

    /// Drops the cached image list.
    pub async fn clear_image_cache(&self) {
        *self.images.write().await = None;
        tracing::info!("image cache cleared");
    }

    /// Applies `action` to `node` of `stack`.
    pub async fn perform_action(&self, stack: &StackHandle, node: &str, action: NodeAction) -> Result<()> {
        if stack.node(node).is_none() {
            return Err(Error::not_found("node", format!("{}/{}", stack.name, node)));
        }
        tracing::info!(stack = %stack.name, node = %node, action = %action, "node action");
        self.backend.node_action(&stack.name, node, action).await
    }
}
