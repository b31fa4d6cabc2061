//! Cache-aside response layer.
//!
//! Read results are memoized under keys derived from tenant, resource kind and
//! request identity, expire after a route-specific TTL, and are dropped by
//! prefix when the tenant writes.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! backend = "redis"            # memory | redis | disabled
//! redis_url = "redis://127.0.0.1:6379/0"
//! key_prefix = "tenantry:"
//! default_ttl_seconds = 300
//!
//! [cache.route_ttls]
//! "/reports" = 60
//! "/reports/live" = 0          # never cached
//! ```

mod aside;
mod backend;
mod config;
mod error;
mod keys;
mod middleware;
mod redis;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

pub use aside::{CacheAside, METRIC_CACHE_ERROR, METRIC_CACHE_HIT, METRIC_CACHE_MISS};
pub use backend::{CacheBackend, DisabledBackend, MemoryBackend};
pub use config::{CacheBackendKind, CacheConfig};
pub use error::CacheError;
pub use keys::{CacheKey, CacheScope, normalize_query};
pub use middleware::{
    CACHE_STATUS_HEADER, CacheLayerState, CachedResponse, invalidate_writes, read_through,
    should_store_response,
};
pub use self::redis::{METRIC_CACHE_RECONNECT, RedisBackend, RedisOptions};

/// A ready cache plus the reconnect supervisor, when the backend has one.
pub struct CacheRuntime {
    pub cache: CacheAside,
    pub supervisor: Option<JoinHandle<()>>,
}

impl CacheRuntime {
    /// Stop background work owned by the cache.
    pub async fn stop(self) {
        if let Some(handle) = self.supervisor {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Build the configured backend. An unreachable Redis is not an error.
pub async fn connect(config: &CacheConfig) -> Result<CacheRuntime, CacheError> {
    let (backend, supervisor): (Arc<dyn CacheBackend>, _) = match config.backend {
        CacheBackendKind::Memory => (Arc::new(MemoryBackend::new(config.memory_capacity)), None),
        CacheBackendKind::Disabled => (Arc::new(DisabledBackend), None),
        CacheBackendKind::Redis => {
            let url = config.redis_url.clone().ok_or(CacheError::Backend {
                backend: "redis",
                message: "cache.redis_url is required for the redis backend".to_string(),
            })?;
            let redis = RedisBackend::connect(RedisOptions {
                url,
                key_prefix: config.key_prefix.clone(),
                reconnect_min: config.reconnect_min,
                reconnect_max: config.reconnect_max,
            })
            .await?;
            let supervisor = redis.spawn_supervisor();
            (Arc::new(redis), Some(supervisor))
        }
    };

    info!(backend = backend.name(), "cache backend ready");
    Ok(CacheRuntime {
        cache: CacheAside::new(backend),
        supervisor,
    })
}
