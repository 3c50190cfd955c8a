//! Pool- and unit-scoped exclusive locks.
//!
//! Lock rows live in the [`Store`]; `Store::insert_lock` is an atomic
//! conditional insert, so two concurrent acquisitions of overlapping scopes
//! can never both succeed. Scopes form a two-level hierarchy: a pool lock
//! overlaps every unit lock in that pool. A holder that needs both scopes
//! takes the pool lock first and the unit lock second, and releases them in
//! reverse order.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{LockId, PoolId, RequestId, UnitId};
use crate::store::Store;

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockScope {
    /// Structural mutation of a whole pool.
    Pool(PoolId),
    /// Mutation of a single allocation unit.
    Unit { pool: PoolId, unit: UnitId },
}

impl LockScope {
    /// Pool the scope belongs to.
    pub fn pool_id(&self) -> PoolId {
        match self {
            LockScope::Pool(pool) | LockScope::Unit { pool, .. } => *pool,
        }
    }

    /// Returns true if the two scopes cover any common record.
    pub fn overlaps(&self, other: &LockScope) -> bool {
        match (self, other) {
            (LockScope::Unit { unit: a, .. }, LockScope::Unit { unit: b, .. }) => a == b,
            _ => self.pool_id() == other.pool_id(),
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Pool(pool) => write!(f, "pool {}", pool),
            LockScope::Unit { unit, .. } => write!(f, "unit {}", unit),
        }
    }
}

/// Identity of whoever holds a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockHolder {
    /// An allocation or cleanup request; held until the request is terminal.
    Request(RequestId),
    /// A synchronous pool or unit operation, or an explicit pool reservation.
    Operation(Uuid),
}

impl LockHolder {
    /// Creates a holder for a one-off operation.
    pub fn operation() -> Self {
        LockHolder::Operation(Uuid::new_v4())
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHolder::Request(id) => write!(f, "request {}", id),
            LockHolder::Operation(id) => write!(f, "operation {}", id),
        }
    }
}

/// A live mutual-exclusion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: LockId,
    pub scope: LockScope,
    pub holder: LockHolder,
    /// Principal that owns the lock, for explicit reservations.
    pub principal: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(scope: LockScope, holder: LockHolder, principal: Option<String>) -> Self {
        Self {
            id: LockId::new(),
            scope,
            holder,
            principal,
            created_at: Utc::now(),
        }
    }

    /// Returns true if this live lock forbids inserting `candidate`.
    ///
    /// The same scope is never taken twice, even by the same holder. A holder
    /// may nest a unit lock under its own pool lock.
    pub fn blocks(&self, candidate: &Lock) -> bool {
        self.scope == candidate.scope
            || (self.scope.overlaps(&candidate.scope) && self.holder != candidate.holder)
    }
}

/// A pool lock with a unit lock nested under it.
#[derive(Debug, Clone)]
pub struct NestedLocks {
    pub pool: Lock,
    pub unit: Lock,
}

/// Acquires and releases locks against the store's lock table.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn Store>,
}

impl LockManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Acquires an exclusive lock, failing with `LockConflict` if any live
    /// lock overlaps the scope.
    pub async fn acquire(
        &self,
        scope: LockScope,
        holder: LockHolder,
        principal: Option<String>,
    ) -> Result<Lock> {
        let lock = Lock::new(scope, holder, principal);
        self.store.insert_lock(lock.clone()).await?;
        tracing::debug!(lock_id = %lock.id, scope = %scope, holder = %holder, "acquired lock");
        Ok(lock)
    }

    /// Acquires the pool lock, then the unit lock, for the same holder.
    ///
    /// The pool lock is released again if the unit lock cannot be taken.
    pub async fn acquire_nested(
        &self,
        pool: PoolId,
        unit: UnitId,
        holder: LockHolder,
    ) -> Result<NestedLocks> {
        let pool_lock = self.acquire(LockScope::Pool(pool), holder, None).await?;
        match self
            .acquire(LockScope::Unit { pool, unit }, holder, None)
            .await
        {
            Ok(unit_lock) => Ok(NestedLocks {
                pool: pool_lock,
                unit: unit_lock,
            }),
            Err(e) => {
                self.release(&pool_lock).await?;
                Err(e)
            }
        }
    }

    /// Releases a lock. Releasing an already released lock is a no-op.
    pub async fn release(&self, lock: &Lock) -> Result<()> {
        if self.store.delete_lock(lock.id).await? {
            tracing::debug!(lock_id = %lock.id, scope = %lock.scope, "released lock");
        } else {
            tracing::debug!(lock_id = %lock.id, "lock already released");
        }
        Ok(())
    }

    /// Releases nested locks in reverse acquisition order.
    pub async fn release_nested(&self, locks: &NestedLocks) -> Result<()> {
        self.release(&locks.unit).await?;
        self.release(&locks.pool).await
    }

    /// Releases every lock held by `holder`, unit locks before pool locks.
    pub async fn release_held_by(&self, holder: LockHolder) -> Result<usize> {
        let mut held: Vec<Lock> = self
            .store
            .list_locks()
            .await?
            .into_iter()
            .filter(|l| l.holder == holder)
            .collect();
        held.sort_by_key(|l| matches!(l.scope, LockScope::Pool(_)));

        for lock in &held {
            self.release(lock).await?;
        }
        Ok(held.len())
    }

    /// Returns the live lock covering exactly this scope, if any.
    pub async fn lock_for(&self, scope: LockScope) -> Result<Option<Lock>> {
        Ok(self
            .store
            .list_locks()
            .await?
            .into_iter()
            .find(|l| l.scope == scope))
    }

    /// Releases locks whose owner can no longer release them.
    ///
    /// Meant to run once at process start: request locks whose request is
    /// terminal or gone, and anonymous operation locks (no operation
    /// survives a restart). Principal-owned reservations are kept.
    pub async fn recover(&self) -> Result<usize> {
        let mut released = 0;
        for lock in self.store.list_locks().await? {
            let stale = match lock.holder {
                LockHolder::Request(request_id) => match self.store.get_request(request_id).await {
                    Ok(request) => request.is_terminal(),
                    Err(Error::NotFound { .. }) => true,
                    Err(e) => return Err(e),
                },
                LockHolder::Operation(_) => lock.principal.is_none(),
            };
            if stale {
                tracing::info!(lock_id = %lock.id, scope = %lock.scope, holder = %lock.holder, "releasing stale lock");
                self.release(&lock).await?;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobId, Request, RequestKind};
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn manager() -> (Arc<MemoryStore>, LockManager) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), LockManager::new(store))
    }

    #[tokio::test]
    async fn second_unit_lock_conflicts() {
        let (_, locks) = manager();
        let pool = PoolId::new();
        let scope = LockScope::Unit {
            pool,
            unit: UnitId::new(),
        };

        locks
            .acquire(scope, LockHolder::operation(), None)
            .await
            .unwrap();
        let err = locks
            .acquire(scope, LockHolder::operation(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }));
    }

    #[tokio::test]
    async fn pool_lock_conflicts_with_busy_unit_and_vice_versa() {
        let (_, locks) = manager();
        let pool = PoolId::new();
        let unit_scope = LockScope::Unit {
            pool,
            unit: UnitId::new(),
        };

        let unit_lock = locks
            .acquire(unit_scope, LockHolder::operation(), None)
            .await
            .unwrap();
        assert!(locks
            .acquire(LockScope::Pool(pool), LockHolder::operation(), None)
            .await
            .is_err());

        locks.release(&unit_lock).await.unwrap();
        let _pool_lock = locks
            .acquire(LockScope::Pool(pool), LockHolder::operation(), None)
            .await
            .unwrap();
        assert!(locks
            .acquire(unit_scope, LockHolder::operation(), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn other_pools_are_independent() {
        let (_, locks) = manager();
        locks
            .acquire(LockScope::Pool(PoolId::new()), LockHolder::operation(), None)
            .await
            .unwrap();
        locks
            .acquire(LockScope::Pool(PoolId::new()), LockHolder::operation(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nested_acquisition_succeeds_for_one_holder() {
        let (store, locks) = manager();
        let pool = PoolId::new();
        let nested = locks
            .acquire_nested(pool, UnitId::new(), LockHolder::operation())
            .await
            .unwrap();
        assert_eq!(store.list_locks().await.unwrap().len(), 2);

        locks.release_nested(&nested).await.unwrap();
        assert!(store.list_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_nested_acquisition_releases_pool_lock() {
        let (store, locks) = manager();
        let pool = PoolId::new();
        let unit = UnitId::new();
        let holder = LockHolder::operation();
        locks
            .acquire(LockScope::Unit { pool, unit }, holder, None)
            .await
            .unwrap();

        // The pool lock nests fine, the unit lock is already taken.
        let err = locks.acquire_nested(pool, unit, holder).await.unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }));

        let remaining = store.list_locks().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(matches!(remaining[0].scope, LockScope::Unit { .. }));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (_, locks) = manager();
        let lock = locks
            .acquire(LockScope::Pool(PoolId::new()), LockHolder::operation(), None)
            .await
            .unwrap();
        locks.release(&lock).await.unwrap();
        locks.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_acquisitions_have_one_winner() {
        let (_, locks) = manager();
        let scope = LockScope::Unit {
            pool: PoolId::new(),
            unit: UnitId::new(),
        };

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire(scope, LockHolder::operation(), None).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, Error::LockConflict { .. })),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn recover_releases_locks_of_terminal_or_missing_requests() {
        let (store, locks) = manager();
        let pool = PoolId::new();

        // Missing request.
        locks
            .acquire(LockScope::Pool(pool), LockHolder::Request(RequestId::new()), None)
            .await
            .unwrap();

        // Terminal request.
        let mut finished = Request::new(RequestKind::Cleanup, UnitId::new(), pool, JobId::new());
        finished.stages[0].fail("boom", None);
        let finished_id = finished.id;
        store.insert_request(finished).await.unwrap();
        locks
            .acquire(
                LockScope::Unit {
                    pool: PoolId::new(),
                    unit: UnitId::new(),
                },
                LockHolder::Request(finished_id),
                None,
            )
            .await
            .unwrap();

        // Live request and a principal reservation survive.
        let live = Request::new(RequestKind::Allocation, UnitId::new(), pool, JobId::new());
        let live_id = live.id;
        store.insert_request(live).await.unwrap();
        locks
            .acquire(
                LockScope::Pool(PoolId::new()),
                LockHolder::Request(live_id),
                None,
            )
            .await
            .unwrap();
        locks
            .acquire(
                LockScope::Pool(PoolId::new()),
                LockHolder::operation(),
                Some("instructor".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(locks.recover().await.unwrap(), 2);
        assert_eq!(store.list_locks().await.unwrap().len(), 2);
    }

    fn scope_strategy() -> impl Strategy<Value = LockScope> {
        let pools = [PoolId::from(Uuid::from_u128(1)), PoolId::from(Uuid::from_u128(2))];
        let units = [
            UnitId::from(Uuid::from_u128(10)),
            UnitId::from(Uuid::from_u128(11)),
            UnitId::from(Uuid::from_u128(12)),
        ];
        (0usize..2, prop::option::of(0usize..3)).prop_map(move |(p, u)| match u {
            None => LockScope::Pool(pools[p]),
            Some(u) => LockScope::Unit {
                pool: pools[p],
                unit: units[u],
            },
        })
    }

    proptest! {
        #[test]
        fn overlap_is_symmetric(a in scope_strategy(), b in scope_strategy()) {
            prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
        }

        #[test]
        fn distinct_holders_block_overlapping_scopes(a in scope_strategy(), b in scope_strategy()) {
            let first = Lock::new(a, LockHolder::operation(), None);
            let second = Lock::new(b, LockHolder::operation(), None);
            prop_assert_eq!(first.blocks(&second), a.overlaps(&b));
        }

        #[test]
        fn same_scope_always_blocks(a in scope_strategy()) {
            let holder = LockHolder::operation();
            let first = Lock::new(a, holder, None);
            let second = Lock::new(a, holder, None);
            prop_assert!(first.blocks(&second));
        }
    }
}
