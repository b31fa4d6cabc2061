//! Registry of resident tenant pools.
//!
//! Every tenant that has recently done work owns one [`TenantPool`] wrapping
//! its storage handle. The registry map is guarded by a single mutex that is
//! only held for lookups, inserts and removals; handle creation, operations,
//! probes and closes all run outside of it.
//!
//! Per-pool bookkeeping uses one atomic word for the in-flight count. A pool
//! is retired by swapping that word from `0` to a sentinel, so an operation
//! can never start on a pool that eviction or shutdown has claimed, and
//! eviction can never claim a pool with work in flight.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::{self, BoxFuture};
use metrics::{counter, gauge, histogram};
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use tokio::{sync::OnceCell, time::Instant};
use tracing::{debug, info, instrument, warn};

use crate::util::lock::mutex_lock;

use super::{
    config::PoolConfig,
    error::{PoolError, is_connection_fault},
    handle::{HandleFactory, StorageHandle},
    stats::{PoolHealth, PoolStats},
    tenant::TenantId,
};

const SOURCE: &str = "pool::manager";
const RETIRED: usize = usize::MAX;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub const METRIC_POOL_CREATED: &str = "tenantry_pool_created_total";
pub const METRIC_POOL_CREATION_FAILED: &str = "tenantry_pool_creation_failed_total";
pub const METRIC_POOL_EVICTED: &str = "tenantry_pool_evicted_total";
pub const METRIC_POOL_RESIDENT: &str = "tenantry_pool_resident";
pub const METRIC_OPERATION_ERROR: &str = "tenantry_operation_error_total";
pub const METRIC_OPERATION_TIMEOUT: &str = "tenantry_operation_timeout_total";
pub const METRIC_OPERATION_MS: &str = "tenantry_operation_ms";

/// One step of a batch. Steps run in order on a single transaction.
pub type BatchStep<T> = Box<
    dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
>;

/// Box a closure as a [`BatchStep`].
pub fn batch_step<T, F>(step: F) -> BatchStep<T>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>
        + Send
        + 'static,
{
    Box::new(step)
}

type Slot = OnceCell<Arc<TenantPool>>;

/// A tenant's resident storage handle plus its usage accounting.
#[derive(Debug)]
pub struct TenantPool {
    tenant: TenantId,
    handle: StorageHandle,
    created_at: OffsetDateTime,
    last_used_at: Mutex<OffsetDateTime>,
    active: AtomicUsize,
    total: AtomicU64,
    healthy: AtomicBool,
}

impl TenantPool {
    fn new(tenant: TenantId, handle: StorageHandle) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            tenant,
            handle,
            created_at: now,
            last_used_at: Mutex::new(now),
            active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn handle(&self) -> &StorageHandle {
        &self.handle
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn last_used_at(&self) -> OffsetDateTime {
        *mutex_lock(&self.last_used_at, SOURCE, "last_used_at")
    }

    pub fn active_operations(&self) -> usize {
        match self.active.load(Ordering::Acquire) {
            RETIRED => 0,
            count => count,
        }
    }

    pub fn total_operations(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn health(&self) -> PoolHealth {
        if self.healthy.load(Ordering::Acquire) {
            PoolHealth::Healthy
        } else {
            PoolHealth::Unhealthy
        }
    }

    pub fn is_retired(&self) -> bool {
        self.active.load(Ordering::Acquire) == RETIRED
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tenant_id: self.tenant.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at(),
            active_operations: self.active_operations(),
            total_operations: self.total_operations(),
            health: self.health(),
        }
    }

    fn set_health(&self, health: PoolHealth) {
        let was_healthy = self.healthy.swap(health.is_healthy(), Ordering::AcqRel);
        if was_healthy && !health.is_healthy() {
            warn!(tenant_id = %self.tenant, event = "pool.unhealthy", "pool marked unhealthy");
        } else if !was_healthy && health.is_healthy() {
            info!(tenant_id = %self.tenant, event = "pool.recovered", "pool healthy again");
        }
    }

    fn touch(&self) {
        *mutex_lock(&self.last_used_at, SOURCE, "touch") = OffsetDateTime::now_utc();
    }

    fn idle_longer_than(&self, threshold: Duration, now: OffsetDateTime) -> bool {
        let idle = now - self.last_used_at();
        idle.is_positive() && idle.unsigned_abs() > threshold
    }

    /// Claim an in-flight slot unless the pool has been retired.
    fn try_begin(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count != RETIRED).then_some(count + 1)
            })
            .is_ok()
    }

    fn end(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count != RETIRED && count > 0).then(|| count - 1)
            });
    }

    /// Retire the pool if nothing is in flight right now.
    fn try_retire(&self) -> bool {
        self.active
            .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Retire regardless of in-flight work, returning how many were abandoned.
    fn force_retire(&self) -> usize {
        match self.active.swap(RETIRED, Ordering::AcqRel) {
            RETIRED => 0,
            count => count,
        }
    }

    fn observe_failure(&self, err: &sqlx::Error) {
        if is_connection_fault(err) {
            self.set_health(PoolHealth::Unhealthy);
        }
    }
}

/// Scoped in-flight marker. Dropping it releases the slot on every exit
/// path, including timeouts and cancellation of the caller's future.
struct ActiveGuard {
    pool: Arc<TenantPool>,
}

impl ActiveGuard {
    fn enter(pool: Arc<TenantPool>) -> Option<Self> {
        if !pool.try_begin() {
            return None;
        }
        pool.total.fetch_add(1, Ordering::AcqRel);
        pool.touch();
        Some(Self { pool })
    }

    fn pool(&self) -> &TenantPool {
        &self.pool
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.pool.touch();
        self.pool.end();
    }
}

/// Owns the tenant registry and mediates every operation against a tenant's
/// storage.
pub struct PoolManager {
    config: PoolConfig,
    factory: Arc<dyn HandleFactory>,
    registry: Mutex<HashMap<TenantId, Arc<Slot>>>,
}

impl PoolManager {
    pub fn new(config: PoolConfig, factory: Arc<dyn HandleFactory>) -> Self {
        Self {
            config,
            factory,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Return the resident pool for `tenant`, creating it if absent.
    ///
    /// Concurrent callers for an unseen tenant share a single creation. A
    /// failed creation leaves the slot empty so the next call retries.
    pub async fn acquire(&self, tenant: &TenantId) -> Result<Arc<TenantPool>, PoolError> {
        loop {
            let slot = self.slot(tenant);
            let pool = match slot
                .get_or_try_init(|| async { self.create(tenant).await.map(Arc::new) })
                .await
            {
                Ok(pool) => pool.clone(),
                Err(err) => {
                    self.forget_empty_slot(tenant, &slot);
                    return Err(err);
                }
            };

            if !pool.is_retired() && self.is_registered(tenant, &slot) {
                return Ok(pool);
            }

            // The slot was removed by eviction or shutdown while we waited on it.
            if pool.try_retire() {
                pool.handle.close().await;
                debug!(tenant_id = %tenant, "closed orphaned pool");
            }
        }
    }

    /// Run `op` against the tenant's handle with the configured timeout.
    pub async fn execute<T, F>(&self, tenant: &TenantId, op: F) -> Result<T, PoolError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c SqlitePool) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
    {
        self.execute_with_timeout(tenant, self.config.operation_timeout, op)
            .await
    }

    #[instrument(skip_all, fields(tenant_id = %tenant))]
    pub async fn execute_with_timeout<T, F>(
        &self,
        tenant: &TenantId,
        limit: Duration,
        op: F,
    ) -> Result<T, PoolError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c SqlitePool) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
    {
        let guard = self.begin(tenant).await?;
        let started = Instant::now();
        let outcome = tokio::time::timeout(limit, op(guard.pool().handle.db())).await;
        record_latency("execute", started);

        match outcome {
            Ok(Ok(value)) => {
                guard.pool().set_health(PoolHealth::Healthy);
                Ok(value)
            }
            Ok(Err(source)) => {
                guard.pool().observe_failure(&source);
                counter!(METRIC_OPERATION_ERROR, "kind" => "query_execution").increment(1);
                warn!(event = "operation.error", error = %source, "operation failed");
                Err(PoolError::QueryExecution {
                    tenant: tenant.clone(),
                    source,
                })
            }
            Err(_) => Err(timed_out(tenant, limit)),
        }
    }

    /// Run `steps` in order inside one transaction with the configured
    /// timeout. Any failure rolls back the whole batch.
    pub async fn run_batch<T: Send>(
        &self,
        tenant: &TenantId,
        steps: Vec<BatchStep<T>>,
    ) -> Result<Vec<T>, PoolError> {
        self.run_batch_with_timeout(tenant, self.config.operation_timeout, steps)
            .await
    }

    #[instrument(skip_all, fields(tenant_id = %tenant, steps = steps.len()))]
    pub async fn run_batch_with_timeout<T: Send>(
        &self,
        tenant: &TenantId,
        limit: Duration,
        steps: Vec<BatchStep<T>>,
    ) -> Result<Vec<T>, PoolError> {
        let guard = self.begin(tenant).await?;
        let started = Instant::now();
        let outcome = tokio::time::timeout(limit, run_steps(guard.pool(), steps)).await;
        record_latency("batch", started);

        match outcome {
            Ok(Ok(values)) => {
                guard.pool().set_health(PoolHealth::Healthy);
                Ok(values)
            }
            Ok(Err((step, source))) => {
                guard.pool().observe_failure(&source);
                counter!(METRIC_OPERATION_ERROR, "kind" => "transaction").increment(1);
                warn!(event = "operation.error", ?step, error = %source, "batch rolled back");
                Err(PoolError::Transaction {
                    tenant: tenant.clone(),
                    step,
                    source,
                })
            }
            // Dropping the transaction on timeout rolls it back.
            Err(_) => Err(timed_out(tenant, limit)),
        }
    }

    /// Probe the tenant's resident handle. Returns `None` when no live pool
    /// is resident; never creates one. Never touches usage accounting; a
    /// failed probe marks the pool unhealthy but leaves it resident.
    pub async fn health_check(&self, tenant: &TenantId) -> Option<PoolHealth> {
        let pool = {
            let registry = mutex_lock(&self.registry, SOURCE, "health_check");
            registry.get(tenant).and_then(|slot| slot.get()).cloned()
        }?;
        if pool.is_retired() {
            return None;
        }
        Some(self.probe(&pool).await)
    }

    /// Probe every resident pool.
    pub async fn health_check_all(&self) -> Vec<(TenantId, PoolHealth)> {
        let pools = self.resident();
        let probes = pools.iter().map(|pool| async move {
            let health = self.probe(pool).await;
            (pool.tenant.clone(), health)
        });
        future::join_all(probes).await
    }

    /// Evict every pool with nothing in flight whose last use is older than
    /// `threshold` at `now`. Returns the evicted tenant ids.
    pub async fn evict_idle(&self, threshold: Duration, now: OffsetDateTime) -> Vec<TenantId> {
        let mut evicted = Vec::new();
        {
            let mut registry = mutex_lock(&self.registry, SOURCE, "evict_idle");
            registry.retain(|_, slot| {
                let Some(pool) = slot.get() else {
                    return true;
                };
                if !pool.idle_longer_than(threshold, now) || !pool.try_retire() {
                    return true;
                }
                evicted.push(pool.clone());
                false
            });
        }
        self.publish_resident();

        for pool in &evicted {
            pool.handle.close().await;
            counter!(METRIC_POOL_EVICTED).increment(1);
            info!(
                tenant_id = %pool.tenant,
                event = "pool.evicted",
                total_operations = pool.total_operations(),
                "evicted idle pool"
            );
        }

        evicted.into_iter().map(|pool| pool.tenant.clone()).collect()
    }

    /// Close every resident pool and empty the registry.
    ///
    /// Each pool gets up to `shutdown_grace` for its in-flight operations to
    /// finish before its handle is closed anyway. Pools are drained
    /// concurrently; a slow pool does not delay closing the others.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<TenantPool>> = {
            let mut registry = mutex_lock(&self.registry, SOURCE, "shutdown");
            registry
                .drain()
                .filter_map(|(_, slot)| slot.get().cloned())
                .collect()
        };
        self.publish_resident();

        info!(pools = drained.len(), "shutting down tenant pools");
        let grace = self.config.shutdown_grace;
        future::join_all(drained.iter().map(|pool| drain_and_close(pool, grace))).await;
        info!("tenant pools closed");
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.resident().iter().map(|pool| pool.stats()).collect();
        stats.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        stats
    }

    pub fn stats_for(&self, tenant: &TenantId) -> Option<PoolStats> {
        let registry = mutex_lock(&self.registry, SOURCE, "stats_for");
        registry
            .get(tenant)
            .and_then(|slot| slot.get())
            .map(|pool| pool.stats())
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .resident()
            .iter()
            .map(|pool| pool.tenant.clone())
            .collect();
        tenants.sort();
        tenants
    }

    pub fn resident_count(&self) -> usize {
        let registry = mutex_lock(&self.registry, SOURCE, "resident_count");
        registry.values().filter(|slot| slot.initialized()).count()
    }

    async fn begin(&self, tenant: &TenantId) -> Result<ActiveGuard, PoolError> {
        loop {
            let pool = self.acquire(tenant).await?;
            if let Some(guard) = ActiveGuard::enter(pool) {
                return Ok(guard);
            }
            debug!(tenant_id = %tenant, "pool retired before operation start, re-acquiring");
        }
    }

    async fn probe(&self, pool: &TenantPool) -> PoolHealth {
        let health = match tokio::time::timeout(self.config.operation_timeout, pool.handle.probe())
            .await
        {
            Ok(Ok(())) => PoolHealth::Healthy,
            Ok(Err(err)) => {
                warn!(tenant_id = %pool.tenant, error = %err, "health probe failed");
                PoolHealth::Unhealthy
            }
            Err(_) => {
                warn!(tenant_id = %pool.tenant, "health probe timed out");
                PoolHealth::Unhealthy
            }
        };
        pool.set_health(health);
        health
    }

    async fn create(&self, tenant: &TenantId) -> Result<TenantPool, PoolError> {
        let handle = match self.factory.open(tenant).await {
            Ok(handle) => handle,
            Err(err) => {
                counter!(METRIC_POOL_CREATION_FAILED).increment(1);
                warn!(tenant_id = %tenant, event = "pool.creation_failed", error = %err, "pool creation failed");
                return Err(err);
            }
        };

        counter!(METRIC_POOL_CREATED).increment(1);
        info!(tenant_id = %tenant, event = "pool.created", "created tenant pool");
        Ok(TenantPool::new(tenant.clone(), handle))
    }

    fn slot(&self, tenant: &TenantId) -> Arc<Slot> {
        let (slot, resident) = {
            let mut registry = mutex_lock(&self.registry, SOURCE, "slot");
            let slot = registry.entry(tenant.clone()).or_default().clone();
            (slot, registry.len())
        };
        if resident > self.config.max_resident {
            warn!(
                tenant_id = %tenant,
                event = "pool.advisory_limit",
                resident,
                max_resident = self.config.max_resident,
                "resident pools exceed advisory limit"
            );
        }
        self.publish_resident();
        slot
    }

    fn is_registered(&self, tenant: &TenantId, slot: &Arc<Slot>) -> bool {
        let registry = mutex_lock(&self.registry, SOURCE, "is_registered");
        registry
            .get(tenant)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn forget_empty_slot(&self, tenant: &TenantId, slot: &Arc<Slot>) {
        let mut registry = mutex_lock(&self.registry, SOURCE, "forget_empty_slot");
        if registry
            .get(tenant)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized())
        {
            registry.remove(tenant);
        }
    }

    fn resident(&self) -> Vec<Arc<TenantPool>> {
        let registry = mutex_lock(&self.registry, SOURCE, "resident");
        registry
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    fn publish_resident(&self) {
        gauge!(METRIC_POOL_RESIDENT).set(self.resident_count() as f64);
    }
}

async fn run_steps<T: Send>(
    pool: &TenantPool,
    steps: Vec<BatchStep<T>>,
) -> Result<Vec<T>, (Option<usize>, sqlx::Error)> {
    let mut tx = pool.handle.db().begin().await.map_err(|err| (None, err))?;
    let mut values = Vec::with_capacity(steps.len());

    for (index, step) in steps.into_iter().enumerate() {
        match step(&mut *tx).await {
            Ok(value) => values.push(value),
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(tenant_id = %pool.tenant, error = %rollback, "batch rollback failed");
                }
                return Err((Some(index), err));
            }
        }
    }

    tx.commit().await.map_err(|err| (None, err))?;
    Ok(values)
}

async fn drain_and_close(pool: &TenantPool, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        if pool.is_retired() || pool.try_retire() {
            break;
        }
        if Instant::now() >= deadline {
            let abandoned = pool.force_retire();
            warn!(
                tenant_id = %pool.tenant,
                abandoned,
                "grace period elapsed with operations in flight, closing anyway"
            );
            break;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }

    pool.handle.close().await;
    info!(
        tenant_id = %pool.tenant,
        event = "pool.closed",
        total_operations = pool.total_operations(),
        "closed tenant pool"
    );
}

fn timed_out(tenant: &TenantId, limit: Duration) -> PoolError {
    counter!(METRIC_OPERATION_TIMEOUT).increment(1);
    warn!(event = "operation.timeout", timeout_ms = limit.as_millis() as u64, "operation timed out");
    PoolError::Timeout {
        tenant: tenant.clone(),
        after: limit,
    }
}

fn record_latency(kind: &'static str, started: Instant) {
    histogram!(METRIC_OPERATION_MS, "kind" => kind).record(started.elapsed().as_secs_f64() * 1000.0);
}
