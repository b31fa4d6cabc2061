//! Per-tenant storage pools.
//!
//! [`PoolManager`] keeps at most one live storage handle per tenant, creates
//! it on first use, counts operations running against it, evicts it once it
//! has been idle long enough, and closes everything on shutdown.

mod config;
mod error;
mod handle;
mod manager;
mod stats;
mod sweeper;
mod tenant;

pub use config::PoolConfig;
pub use error::PoolError;
pub use handle::{HandleFactory, SqliteHandleFactory, StorageHandle};
pub use manager::{
    BatchStep, METRIC_OPERATION_ERROR, METRIC_OPERATION_MS, METRIC_OPERATION_TIMEOUT,
    METRIC_POOL_CREATED, METRIC_POOL_CREATION_FAILED, METRIC_POOL_EVICTED, METRIC_POOL_RESIDENT,
    PoolManager, TenantPool, batch_step,
};
pub use stats::{PoolHealth, PoolStats};
pub use sweeper::spawn_idle_sweeper;
pub use tenant::TenantId;
