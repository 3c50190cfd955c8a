//! In-memory store with JSON snapshot persistence.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::lock::Lock;
use crate::model::{
    JobId, LockId, Pool, PoolId, Request, RequestId, SandboxAllocationUnit, UnitId,
};
use crate::queue::Job;

use super::{Mutation, Store};

#[derive(Default)]
struct Tables {
    pools: HashMap<PoolId, Pool>,
    units: HashMap<UnitId, SandboxAllocationUnit>,
    requests: HashMap<RequestId, Request>,
    jobs: HashMap<JobId, Job>,
    locks: Vec<Lock>,
}

/// On-disk form of the store, written for crash recovery.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub pools: Vec<Pool>,
    pub units: Vec<SandboxAllocationUnit>,
    pub requests: Vec<Request>,
    pub jobs: Vec<Job>,
    pub locks: Vec<Lock>,
}

/// Process-local store. All tables sit behind one mutex, which makes every
/// operation, including conditional lock insert, atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn apply<T: Clone>(record: &mut T, mutation: Mutation<T>) -> Result<T> {
    let mut updated = record.clone();
    mutation(&mut updated)?;
    *record = updated.clone();
    Ok(updated)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let tables = Tables {
            pools: snapshot.pools.into_iter().map(|p| (p.id, p)).collect(),
            units: snapshot.units.into_iter().map(|u| (u.id, u)).collect(),
            requests: snapshot.requests.into_iter().map(|r| (r.id, r)).collect(),
            jobs: snapshot.jobs.into_iter().map(|j| (j.id, j)).collect(),
            locks: snapshot.locks,
        };
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Loads the store from a snapshot file, or starts empty if it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let json = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&json).map_err(|e| {
            Error::Store(format!("unreadable snapshot {}: {}", path.display(), e))
        })?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Copies the current contents into a snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        let tables = self.tables.lock().await;
        let mut requests: Vec<Request> = tables.requests.values().cloned().collect();
        requests.sort_by_key(|r| r.created_at);
        Snapshot {
            pools: tables.pools.values().cloned().collect(),
            units: tables.units.values().cloned().collect(),
            requests,
            jobs: tables.jobs.values().cloned().collect(),
            locks: tables.locks.clone(),
        }
    }

    /// Writes a snapshot to `path`, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot().await)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_pool(&self, pool: Pool) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.pools.values().any(|p| p.name == pool.name) {
            return Err(Error::Validation(format!("pool '{}' already exists", pool.name)));
        }
        tables.pools.insert(pool.id, pool);
        Ok(())
    }

    async fn get_pool(&self, id: PoolId) -> Result<Pool> {
        self.tables
            .lock()
            .await
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("pool", id))
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let mut pools: Vec<Pool> = self.tables.lock().await.pools.values().cloned().collect();
        pools.sort_by_key(|p| p.created_at);
        Ok(pools)
    }

    async fn modify_pool(&self, id: PoolId, mutation: Mutation<Pool>) -> Result<Pool> {
        let mut tables = self.tables.lock().await;
        let pool = tables
            .pools
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("pool", id))?;
        apply(pool, mutation)
    }

    async fn delete_pool(&self, id: PoolId) -> Result<()> {
        self.tables
            .lock()
            .await
            .pools
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("pool", id))
    }

    async fn insert_unit(&self, unit: SandboxAllocationUnit) -> Result<()> {
        self.tables.lock().await.units.insert(unit.id, unit);
        Ok(())
    }

    async fn get_unit(&self, id: UnitId) -> Result<SandboxAllocationUnit> {
        self.tables
            .lock()
            .await
            .units
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("unit", id))
    }

    async fn list_units(&self, pool: PoolId) -> Result<Vec<SandboxAllocationUnit>> {
        let mut units: Vec<SandboxAllocationUnit> = self
            .tables
            .lock()
            .await
            .units
            .values()
            .filter(|u| u.pool_id == pool)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.created_at);
        Ok(units)
    }

    async fn modify_unit(
        &self,
        id: UnitId,
        mutation: Mutation<SandboxAllocationUnit>,
    ) -> Result<SandboxAllocationUnit> {
        let mut tables = self.tables.lock().await;
        let unit = tables
            .units
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("unit", id))?;
        apply(unit, mutation)
    }

    async fn delete_unit(&self, id: UnitId) -> Result<()> {
        self.tables
            .lock()
            .await
            .units
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("unit", id))
    }

    async fn insert_request(&self, request: Request) -> Result<()> {
        self.tables.lock().await.requests.insert(request.id, request);
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Request> {
        self.tables
            .lock()
            .await
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("request", id))
    }

    async fn list_requests(&self) -> Result<Vec<Request>> {
        let mut requests: Vec<Request> =
            self.tables.lock().await.requests.values().cloned().collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn modify_request(
        &self,
        id: RequestId,
        mutation: Mutation<Request>,
    ) -> Result<Request> {
        let mut tables = self.tables.lock().await;
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("request", id))?;
        apply(request, mutation)
    }

    async fn insert_job(&self, job: Job) -> Result<()> {
        self.tables.lock().await.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn modify_job(&self, id: JobId, mutation: Mutation<Job>) -> Result<Option<Job>> {
        let mut tables = self.tables.lock().await;
        match tables.jobs.get_mut(&id) {
            Some(job) => apply(job, mutation).map(Some),
            None => Ok(None),
        }
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        Ok(self.tables.lock().await.jobs.remove(&id).is_some())
    }

    async fn list_jobs(&self, request: RequestId) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .tables
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.request_id == request)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.stage_index);
        Ok(jobs)
    }

    async fn insert_lock(&self, lock: Lock) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.locks.iter().find(|l| l.blocks(&lock)) {
            return Err(Error::LockConflict {
                scope: existing.scope,
                holder: existing.holder,
            });
        }
        tables.locks.push(lock);
        Ok(())
    }

    async fn delete_lock(&self, id: LockId) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let before = tables.locks.len();
        tables.locks.retain(|l| l.id != id);
        Ok(tables.locks.len() != before)
    }

    async fn list_locks(&self) -> Result<Vec<Lock>> {
        Ok(self.tables.lock().await.locks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockHolder, LockScope};
    use crate::model::{RequestKind, StackDefinition};
    use tempfile::TempDir;

    fn pool() -> Pool {
        Pool::new("demo", 2, StackDefinition::new("demo", "git@example:demo.git", "main"))
    }

    #[tokio::test]
    async fn failed_mutation_leaves_record_untouched() {
        let store = MemoryStore::new();
        let pool = pool();
        let id = pool.id;
        store.insert_pool(pool).await.unwrap();

        let result = store
            .modify_pool(
                id,
                Box::new(|p: &mut Pool| {
                    p.max_size = 99;
                    Err(Error::Validation("nope".to_string()))
                }),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.get_pool(id).await.unwrap().max_size, 2);
    }

    #[tokio::test]
    async fn modify_missing_job_returns_none() {
        let store = MemoryStore::new();
        let result = store
            .modify_job(JobId::new(), Box::new(|_: &mut Job| Ok(())))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn delete_lock_reports_whether_it_existed() {
        let store = MemoryStore::new();
        let lock = Lock::new(LockScope::Pool(PoolId::new()), LockHolder::operation(), None);
        let id = lock.id;
        store.insert_lock(lock).await.unwrap();
        assert!(store.delete_lock(id).await.unwrap());
        assert!(!store.delete_lock(id).await.unwrap());
    }

    #[tokio::test]
    async fn units_are_listed_per_pool() {
        let store = MemoryStore::new();
        let a = PoolId::new();
        let b = PoolId::new();
        store.insert_unit(SandboxAllocationUnit::new(a)).await.unwrap();
        store.insert_unit(SandboxAllocationUnit::new(a)).await.unwrap();
        store.insert_unit(SandboxAllocationUnit::new(b)).await.unwrap();
        assert_eq!(store.list_units(a).await.unwrap().len(), 2);
        assert_eq!(store.list_units(b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_save_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("store.json");

        let store = MemoryStore::new();
        let pool = pool();
        let unit = SandboxAllocationUnit::new(pool.id);
        let request = Request::new(RequestKind::Allocation, unit.id, pool.id, JobId::new());
        let lock = Lock::new(
            LockScope::Unit {
                pool: pool.id,
                unit: unit.id,
            },
            LockHolder::Request(request.id),
            None,
        );
        let request_id = request.id;
        store.insert_pool(pool).await.unwrap();
        store.insert_unit(unit).await.unwrap();
        store.insert_request(request).await.unwrap();
        store.insert_lock(lock).await.unwrap();
        store.save(&path).await.unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.list_pools().await.unwrap().len(), 1);
        assert_eq!(reopened.list_locks().await.unwrap().len(), 1);
        assert_eq!(
            reopened.get_request(request_id).await.unwrap().kind,
            RequestKind::Allocation
        );
    }

    #[tokio::test]
    async fn duplicate_pool_name_is_rejected() {
        let store = MemoryStore::new();
        store.insert_pool(pool()).await.unwrap();
        let err = store.insert_pool(pool()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.list_pools().await.unwrap().len(), 1);
    }

    #[test]
    fn unreadable_snapshot_is_a_store_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = MemoryStore::open(&path).err().unwrap();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn open_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(&dir.path().join("absent.json")).unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        assert!(runtime.block_on(store.list_pools()).unwrap().is_empty());
    }
}
