//! In-process backends for driving the service without external tools.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::watch;

use sandbox_allocator::config::{BarrierConfig, RunnerConfig};
use sandbox_allocator::{
    Backends, Config, CredentialRemover, Error, ExecutionBackend, ExecutionUnit, ExitStatus,
    ImageRef, LogBuffer, MemoryStore, NodeAction, Pool, ProvisionerBackend, Result, RunHandle,
    RunSpec, SandboxService, StackDefinition, StackHandle, StackNode, UnitId,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Ordered record of every backend call, shared by all fakes.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.all().iter().any(|e| e.starts_with(prefix))
    }

    /// Waits until an event starting with `prefix` shows up.
    pub async fn wait_for(&self, prefix: &str) {
        tokio::time::timeout(WAIT, async {
            while !self.contains(prefix) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no '{}' event in {:?}", prefix, self.all()));
    }
}

pub struct FakeProvisioner {
    events: Events,
    pub block_create: Mutex<bool>,
    pub fail_create: Mutex<bool>,
    pub image_fetches: AtomicUsize,
}

impl FakeProvisioner {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            block_create: Mutex::new(false),
            fail_create: Mutex::new(false),
            image_fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProvisionerBackend for FakeProvisioner {
    async fn create(&self, name: &str, _definition: &StackDefinition) -> Result<StackHandle> {
        self.events.push(format!("create {}", name));
        if *self.block_create.lock().unwrap() {
            std::future::pending::<()>().await;
        }
        if *self.fail_create.lock().unwrap() {
            return Err(Error::Provision(format!("quota exceeded for {}", name)));
        }
        Ok(StackHandle {
            name: name.to_string(),
            nodes: vec![StackNode {
                name: "router".to_string(),
                address: "10.0.0.1".to_string(),
            }],
            outputs: BTreeMap::new(),
        })
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.events.push(format!("destroy {}", name));
        Ok(())
    }

    async fn fetch_images(&self) -> Result<Vec<ImageRef>> {
        self.image_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ImageRef {
            id: "img-1".to_string(),
            name: "ubuntu-24.04".to_string(),
            created_at: None,
        }])
    }

    async fn node_action(&self, stack: &str, node: &str, action: NodeAction) -> Result<()> {
        self.events.push(format!("node {} {} {}", action, stack, node));
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Execution backend whose units exit with a configured code per stage.
pub struct FakeRunner {
    events: Events,
    /// Exit code by stage name; missing stages exit 0.
    pub exit_codes: Mutex<HashMap<String, i32>>,
    /// Stages whose units run until terminated.
    pub blocking: Mutex<HashSet<String>>,
}

impl FakeRunner {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            exit_codes: Mutex::new(HashMap::new()),
            blocking: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ExecutionBackend for FakeRunner {
    async fn start(&self, spec: RunSpec) -> Result<RunHandle> {
        let stage = spec.env.get("SANDBOX_STAGE").cloned().unwrap_or_default();
        let mode = spec.env.get("SANDBOX_MODE").cloned().unwrap_or_default();
        self.events.push(format!("start {} {}", stage, mode));

        let logs = LogBuffer::new();
        logs.push(format!("PLAY [{}]", stage));
        let code = self.exit_codes.lock().unwrap().get(&stage).copied().unwrap_or(0);
        let blocking = self.blocking.lock().unwrap().contains(&stage);
        if !blocking {
            logs.close();
        }
        let (terminated, _) = watch::channel(false);
        let unit = FakeUnit {
            name: spec.name.clone(),
            events: self.events.clone(),
            logs: logs.clone(),
            code,
            blocking,
            terminated,
        };
        Ok(RunHandle::new(spec.name, logs, Box::new(unit)))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

struct FakeUnit {
    name: String,
    events: Events,
    logs: LogBuffer,
    code: i32,
    blocking: bool,
    terminated: watch::Sender<bool>,
}

#[async_trait]
impl ExecutionUnit for FakeUnit {
    async fn wait(&self) -> Result<ExitStatus> {
        if self.blocking {
            let mut rx = self.terminated.subscribe();
            let _ = rx.wait_for(|t| *t).await;
            return Ok(ExitStatus { code: Some(143) });
        }
        Ok(ExitStatus { code: Some(self.code) })
    }

    async fn terminate(&self) -> Result<()> {
        self.events.push(format!("terminate {}", self.name));
        self.logs.close();
        self.terminated.send_replace(true);
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        self.events.push(format!("remove {}", self.name));
        Ok(())
    }

    fn remove_blocking(&self) {
        self.events.push(format!("remove {}", self.name));
    }
}

#[derive(Default)]
pub struct RecordingRemover {
    pub removed: Mutex<Vec<UnitId>>,
}

#[async_trait]
impl CredentialRemover for RecordingRemover {
    async fn remove_credentials(&self, unit: UnitId) -> Result<()> {
        self.removed.lock().unwrap().push(unit);
        Ok(())
    }
}

/// A service over fake backends plus handles to inspect them.
pub struct Harness {
    pub service: Arc<SandboxService>,
    pub store: Arc<MemoryStore>,
    pub events: Events,
    pub provisioner: Arc<FakeProvisioner>,
    pub runner: Arc<FakeRunner>,
    pub credentials: Arc<RecordingRemover>,
    pub config: Config,
    _dir: Arc<TempDir>,
}

impl Harness {
    /// Builds a harness without starting workers.
    pub fn new() -> Self {
        let dir = Arc::new(TempDir::new().unwrap());
        let config = Config {
            barrier: BarrierConfig {
                poll_interval_ms: 5,
                poll_max_ms: 20,
                timeout_secs: 5,
                ..Default::default()
            },
            runner: RunnerConfig {
                work_dir: dir.path().join("runs"),
                credentials_dir: dir.path().join("credentials"),
                ..Default::default()
            },
            ..Default::default()
        };
        Self::with_store(config, Arc::new(MemoryStore::new()), dir)
    }

    /// A second service over the same store, as after a restart.
    pub fn restarted(&self) -> Self {
        Self::with_store(self.config.clone(), self.store.clone(), self._dir.clone())
    }

    fn with_store(config: Config, store: Arc<MemoryStore>, dir: Arc<TempDir>) -> Self {
        let events = Events::default();
        let provisioner = Arc::new(FakeProvisioner::new(events.clone()));
        let runner = Arc::new(FakeRunner::new(events.clone()));
        let credentials = Arc::new(RecordingRemover::default());
        let backends = Backends {
            provisioner: provisioner.clone(),
            execution: runner.clone(),
            credentials: Some(credentials.clone()),
        };
        let service = Arc::new(SandboxService::new(&config, store.clone(), backends));
        Self {
            service,
            store,
            events,
            provisioner,
            runner,
            credentials,
            config,
            _dir: dir,
        }
    }

    /// Builds a harness and starts its workers.
    pub async fn started() -> Self {
        let harness = Self::new();
        harness.service.start().await.unwrap();
        harness
    }

    pub async fn pool(&self, max_size: usize) -> Pool {
        let definition = StackDefinition::new("lab", "git://stacks/lab", "main");
        self.service
            .create_pool(&format!("lab-{}", uuid::Uuid::new_v4()), max_size, definition)
            .await
            .unwrap()
    }

    pub async fn unit(&self) -> UnitId {
        let pool = self.pool(4).await;
        self.service.create_units(pool.id, 1).await.unwrap()[0].id
    }

    pub fn fail_stage(&self, stage: &str, code: i32) {
        self.runner.exit_codes.lock().unwrap().insert(stage.to_string(), code);
    }

    pub fn block_stage(&self, stage: &str) {
        self.runner.blocking.lock().unwrap().insert(stage.to_string());
    }
}
