//! Caller-facing operations on pools, units and requests.
//!
//! Structural pool changes take the pool lock for their duration. Unit
//! operations that must not overlap a running request take the pool lock
//! and then the unit lock, and release them in reverse order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lock::{Lock, LockHolder, LockManager, LockScope};
use crate::model::{
    Pool, PoolId, RequestId, RequestKind, SandboxAllocationUnit, StackDefinition, UnitId,
};
use crate::pipeline::{PipelineEngine, RecoveryReport, RequestReport, StageExecutor};
use crate::provisioner::{CommandBackend, ImageRef, NodeAction, ProvisionerBackend, StackProvisioner};
use crate::reconciler::{CleanupReconciler, CredentialRemover, SshCredentialRemover};
use crate::runner::{ContainerCliBackend, ExecutionBackend};
use crate::store::Store;

/// External capabilities the service is wired to.
#[derive(Clone)]
pub struct Backends {
    pub provisioner: Arc<dyn ProvisionerBackend>,
    pub execution: Arc<dyn ExecutionBackend>,
    pub credentials: Option<Arc<dyn CredentialRemover>>,
}

impl Backends {
    /// CLI-driven backends as configured.
    pub fn from_config(config: &Config) -> Self {
        let credentials = config.access_host.as_ref().map(|c| {
            Arc::new(SshCredentialRemover::new(c.clone())) as Arc<dyn CredentialRemover>
        });
        Self {
            provisioner: Arc::new(CommandBackend::new(&config.provisioner)),
            execution: Arc::new(ContainerCliBackend::new(&config.runner)),
            credentials,
        }
    }
}

/// Sandbox pool orchestrator.
pub struct SandboxService {
    store: Arc<dyn Store>,
    engine: PipelineEngine,
    provisioner: StackProvisioner,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SandboxService {
    pub fn new(config: &Config, store: Arc<dyn Store>, backends: Backends) -> Self {
        let provisioner = StackProvisioner::new(backends.provisioner);
        let executor = StageExecutor::new(
            provisioner.clone(),
            backends.execution,
            config.runner.clone(),
        );
        let reconciler = CleanupReconciler::new(backends.credentials);
        let engine = PipelineEngine::new(store.clone(), executor, reconciler, &config.barrier);
        Self {
            store,
            engine,
            provisioner,
            worker_count: config.workers.count,
            workers: Mutex::new(Vec::new()),
        }
    }

    fn locks(&self) -> &LockManager {
        self.engine.locks()
    }

    /// Runs the recovery sweep and starts the workers.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let report = self.engine.recover().await?;
        let handles = self.engine.spawn_workers(self.worker_count);
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
        tracing::info!(workers = self.worker_count, "sandbox service started");
        Ok(report)
    }

    /// Stops the workers once the stages they are running have ended.
    pub async fn shutdown(&self) {
        self.engine.shutdown();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task failed");
            }
        }
        tracing::info!("sandbox service stopped");
    }

    async fn pool_lock(&self, pool_id: PoolId) -> Result<Lock> {
        self.locks()
            .acquire(LockScope::Pool(pool_id), LockHolder::operation(), None)
            .await
    }

    // Pools

    pub async fn create_pool(
        &self,
        name: &str,
        max_size: usize,
        definition: StackDefinition,
    ) -> Result<Pool> {
        if name.trim().is_empty() {
            return Err(Error::Validation("pool name cannot be empty".to_string()));
        }
        if max_size == 0 {
            return Err(Error::Validation("pool max_size must be at least 1".to_string()));
        }
        if definition.source.trim().is_empty() {
            return Err(Error::Validation("stack definition source cannot be empty".to_string()));
        }
        let pool = Pool::new(name, max_size, definition);
        self.store.insert_pool(pool.clone()).await?;
        tracing::info!(pool_id = %pool.id, name = %pool.name, max_size, "pool created");
        Ok(pool)
    }

    pub async fn get_pool(&self, pool_id: PoolId) -> Result<Pool> {
        self.store.get_pool(pool_id).await
    }

    pub async fn list_pools(&self) -> Result<Vec<Pool>> {
        self.store.list_pools().await
    }

    /// Changes a pool's capacity. Refuses to shrink below its unit count.
    pub async fn resize_pool(&self, pool_id: PoolId, max_size: usize) -> Result<Pool> {
        if max_size == 0 {
            return Err(Error::Validation("pool max_size must be at least 1".to_string()));
        }
        let lock = self.pool_lock(pool_id).await?;
        let result = self.resize_pool_locked(pool_id, max_size).await;
        self.locks().release(&lock).await?;
        result
    }

    async fn resize_pool_locked(&self, pool_id: PoolId, max_size: usize) -> Result<Pool> {
        let units = self.store.list_units(pool_id).await?.len();
        if units > max_size {
            return Err(Error::Validation(format!(
                "pool {} has {} units, cannot shrink to {}",
                pool_id, units, max_size
            )));
        }
        let pool = self
            .store
            .modify_pool(
                pool_id,
                Box::new(move |p: &mut Pool| {
                    p.max_size = max_size;
                    Ok(())
                }),
            )
            .await?;
        tracing::info!(pool_id = %pool_id, max_size, "pool resized");
        Ok(pool)
    }

    /// Deletes an empty pool.
    pub async fn delete_pool(&self, pool_id: PoolId) -> Result<()> {
        let lock = self.pool_lock(pool_id).await?;
        let result = self.delete_pool_locked(pool_id).await;
        self.locks().release(&lock).await?;
        result
    }

    async fn delete_pool_locked(&self, pool_id: PoolId) -> Result<()> {
        let units = self.store.list_units(pool_id).await?;
        if !units.is_empty() {
            return Err(Error::InvalidState(format!(
                "pool {} still has {} units",
                pool_id,
                units.len()
            )));
        }
        self.store.delete_pool(pool_id).await?;
        tracing::info!(pool_id = %pool_id, "pool deleted");
        Ok(())
    }

    /// Reserves a pool for `principal` until [`SandboxService::unlock_pool`].
    ///
    /// While reserved, no unit of the pool can start a request.
    pub async fn lock_pool(&self, pool_id: PoolId, principal: &str) -> Result<Lock> {
        if principal.trim().is_empty() {
            return Err(Error::Validation("pool reservation needs a principal".to_string()));
        }
        self.store.get_pool(pool_id).await?;
        let lock = self
            .locks()
            .acquire(
                LockScope::Pool(pool_id),
                LockHolder::operation(),
                Some(principal.to_string()),
            )
            .await?;
        tracing::info!(pool_id = %pool_id, principal = ?lock.principal, "pool reserved");
        Ok(lock)
    }

    /// Releases a reservation taken with [`SandboxService::lock_pool`].
    pub async fn unlock_pool(&self, pool_id: PoolId) -> Result<()> {
        let lock = self
            .locks()
            .lock_for(LockScope::Pool(pool_id))
            .await?
            .ok_or_else(|| Error::not_found("pool lock", pool_id))?;
        if lock.principal.is_none() {
            return Err(Error::InvalidState(format!(
                "pool {} is locked by a running operation, not a reservation",
                pool_id
            )));
        }
        self.locks().release(&lock).await?;
        tracing::info!(pool_id = %pool_id, "pool reservation released");
        Ok(())
    }

    // Units

    /// Adds `count` empty units to a pool, within its capacity.
    pub async fn create_units(&self, pool_id: PoolId, count: usize) -> Result<Vec<SandboxAllocationUnit>> {
        if count == 0 {
            return Err(Error::Validation("unit count must be at least 1".to_string()));
        }
        let lock = self.pool_lock(pool_id).await?;
        let result = self.create_units_locked(pool_id, count).await;
        self.locks().release(&lock).await?;
        result
    }

    async fn create_units_locked(&self, pool_id: PoolId, count: usize) -> Result<Vec<SandboxAllocationUnit>> {
        let pool = self.store.get_pool(pool_id).await?;
        let existing = self.store.list_units(pool_id).await?.len();
        if existing + count > pool.max_size {
            return Err(Error::Validation(format!(
                "pool {} has room for {} more units, {} requested",
                pool.name,
                pool.max_size - existing.min(pool.max_size),
                count
            )));
        }

        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            let unit = SandboxAllocationUnit::new(pool_id);
            self.store.insert_unit(unit.clone()).await?;
            units.push(unit);
        }
        tracing::info!(pool_id = %pool_id, count, "units created");
        Ok(units)
    }

    /// Creates `count` units and requests allocation of each.
    pub async fn create_and_allocate(&self, pool_id: PoolId, count: usize) -> Result<Vec<(UnitId, RequestId)>> {
        let units = self.create_units(pool_id, count).await?;
        let mut requests = Vec::with_capacity(units.len());
        for unit in units {
            let request = self.request_allocation(unit.id).await?;
            requests.push((unit.id, request));
        }
        Ok(requests)
    }

    pub async fn get_unit(&self, unit_id: UnitId) -> Result<SandboxAllocationUnit> {
        self.store.get_unit(unit_id).await
    }

    pub async fn list_units(&self, pool_id: PoolId) -> Result<Vec<SandboxAllocationUnit>> {
        self.store.list_units(pool_id).await
    }

    /// Deletes a unit that holds no sandbox and has no request in flight.
    pub async fn delete_unit(&self, unit_id: UnitId) -> Result<()> {
        let unit = self.store.get_unit(unit_id).await?;
        let locks = self
            .locks()
            .acquire_nested(unit.pool_id, unit_id, LockHolder::operation())
            .await?;
        let result = self.delete_unit_locked(unit_id).await;
        self.locks().release_nested(&locks).await?;
        result
    }

    async fn delete_unit_locked(&self, unit_id: UnitId) -> Result<()> {
        let unit = self.store.get_unit(unit_id).await?;
        if unit.is_allocated() {
            return Err(Error::InvalidState(format!(
                "unit {} still has a sandbox, clean it up first",
                unit_id
            )));
        }
        if self.engine.needs_cleanup(&unit).await? {
            return Err(Error::InvalidState(format!(
                "latest allocation of unit {} may have left a stack behind, clean it up first",
                unit_id
            )));
        }
        self.store.delete_unit(unit_id).await?;
        tracing::info!(unit_id = %unit_id, pool_id = %unit.pool_id, "unit deleted");
        Ok(())
    }

    // Requests

    pub async fn request_allocation(&self, unit_id: UnitId) -> Result<RequestId> {
        self.engine.start_request(unit_id, RequestKind::Allocation).await
    }

    pub async fn request_cleanup(&self, unit_id: UnitId) -> Result<RequestId> {
        self.engine.start_request(unit_id, RequestKind::Cleanup).await
    }

    pub async fn get_request_status(&self, request_id: RequestId) -> Result<RequestReport> {
        self.engine.get_request_status(request_id).await
    }

    pub async fn cancel_request(&self, request_id: RequestId) -> Result<RequestReport> {
        self.engine.cancel_request(request_id).await
    }

    pub async fn wait_for_request(&self, request_id: RequestId, timeout: Duration) -> Result<RequestReport> {
        self.engine.wait_for_request(request_id, timeout).await
    }

    /// All requests of a unit, oldest first.
    pub async fn list_unit_requests(&self, unit_id: UnitId) -> Result<Vec<RequestReport>> {
        self.store.get_unit(unit_id).await?;
        Ok(self
            .store
            .list_requests()
            .await?
            .iter()
            .filter(|r| r.unit_id == unit_id)
            .map(RequestReport::from)
            .collect())
    }

    // Sandboxes

    /// Applies a power action to one node of a unit's sandbox.
    ///
    /// An unknown action is rejected before the unit is looked up or locked.
    pub async fn node_action(&self, unit_id: UnitId, node: &str, action: &str) -> Result<()> {
        let action: NodeAction = action.parse()?;
        let unit = self.store.get_unit(unit_id).await?;
        let lock = self
            .locks()
            .acquire(
                LockScope::Unit {
                    pool: unit.pool_id,
                    unit: unit_id,
                },
                LockHolder::operation(),
                None,
            )
            .await?;
        let result = self.node_action_locked(unit_id, node, action).await;
        self.locks().release(&lock).await?;
        result
    }

    async fn node_action_locked(&self, unit_id: UnitId, node: &str, action: NodeAction) -> Result<()> {
        let unit = self.store.get_unit(unit_id).await?;
        match &unit.sandbox {
            Some(sandbox) => self.provisioner.perform_action(&sandbox.stack, node, action).await,
            None => Err(Error::InvalidState(format!("unit {} has no sandbox", unit_id))),
        }
    }

    pub async fn list_images(&self, use_cache: bool) -> Result<Vec<ImageRef>> {
        self.provisioner.list_available_images(use_cache).await
    }

    pub async fn clear_image_cache(&self) {
        self.provisioner.clear_image_cache().await;
    }
}
