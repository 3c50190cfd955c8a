//! Persistence boundary for orchestration records.
//!
//! Beyond plain CRUD the store must provide two primitives:
//! - an atomic conditional insert for lock rows ([`Store::insert_lock`]),
//! - atomic read-modify-write for requests, units and jobs, so the worker
//!   signalling a job and the worker polling it never lose an update.

mod memory;

pub use memory::{MemoryStore, Snapshot};

use async_trait::async_trait;

use crate::error::Result;
use crate::lock::Lock;
use crate::model::{
    JobId, LockId, Pool, PoolId, Request, RequestId, SandboxAllocationUnit, UnitId,
};
use crate::queue::Job;

/// Mutation applied atomically to a stored record.
///
/// Returning an error leaves the stored record untouched.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> Result<()> + Send>;

/// Durable storage for pools, units, requests, jobs and locks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `Validation` if a pool of the same name exists. The name
    /// check and the insert are a single atomic step.
    async fn insert_pool(&self, pool: Pool) -> Result<()>;
    async fn get_pool(&self, id: PoolId) -> Result<Pool>;
    async fn list_pools(&self) -> Result<Vec<Pool>>;
    async fn modify_pool(&self, id: PoolId, mutation: Mutation<Pool>) -> Result<Pool>;
    async fn delete_pool(&self, id: PoolId) -> Result<()>;

    async fn insert_unit(&self, unit: SandboxAllocationUnit) -> Result<()>;
    async fn get_unit(&self, id: UnitId) -> Result<SandboxAllocationUnit>;
    async fn list_units(&self, pool: PoolId) -> Result<Vec<SandboxAllocationUnit>>;
    async fn modify_unit(
        &self,
        id: UnitId,
        mutation: Mutation<SandboxAllocationUnit>,
    ) -> Result<SandboxAllocationUnit>;
    async fn delete_unit(&self, id: UnitId) -> Result<()>;

    async fn insert_request(&self, request: Request) -> Result<()>;
    async fn get_request(&self, id: RequestId) -> Result<Request>;
    /// All requests, oldest first.
    async fn list_requests(&self) -> Result<Vec<Request>>;
    async fn modify_request(&self, id: RequestId, mutation: Mutation<Request>)
        -> Result<Request>;

    async fn insert_job(&self, job: Job) -> Result<()>;
    /// Returns `None` once the job has been deleted.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;
    /// Returns `None` if the job no longer exists.
    async fn modify_job(&self, id: JobId, mutation: Mutation<Job>) -> Result<Option<Job>>;
    /// Returns false if the job was already gone.
    async fn delete_job(&self, id: JobId) -> Result<bool>;
    async fn list_jobs(&self, request: RequestId) -> Result<Vec<Job>>;

    /// Inserts a lock unless a live lock blocks it.
    ///
    /// Fails with `LockConflict` naming the blocking lock. The check and the
    /// insert are a single atomic step.
    async fn insert_lock(&self, lock: Lock) -> Result<()>;
    /// Returns false if the lock was already gone.
    async fn delete_lock(&self, id: LockId) -> Result<bool>;
    async fn list_locks(&self) -> Result<Vec<Lock>>;
}
