//! Cache-aside access to a [`CacheBackend`].

use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{
    backend::CacheBackend,
    error::CacheError,
    keys::{CacheKey, CacheScope},
};

pub const METRIC_CACHE_HIT: &str = "tenantry_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "tenantry_cache_miss_total";
pub const METRIC_CACHE_ERROR: &str = "tenantry_cache_error_total";

type Flight = Arc<OnceCell<Bytes>>;

/// Memoizes read results in a backend and invalidates them on write.
///
/// # Consistency
///
/// Reads served from the cache are eventually consistent: after a write, a
/// cached value can be served until its TTL runs out. A writer that calls
/// [`delete`](Self::delete), [`delete_pattern`](Self::delete_pattern) or
/// [`invalidate`](Self::invalidate) once its write has committed makes the
/// next read recompute. A population racing with that invalidation can still
/// store the pre-write value; the TTL bounds how long it survives.
///
/// Backend failures never surface to callers. A failed read is a miss and a
/// failed write is logged and dropped.
#[derive(Clone)]
pub struct CacheAside {
    backend: Arc<dyn CacheBackend>,
    inflight: Arc<DashMap<String, Flight>>,
}

impl CacheAside {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let backend = self.backend.name();
        match self.backend.get(key.as_str()).await {
            Ok(Some(value)) => {
                counter!(METRIC_CACHE_HIT, "backend" => backend).increment(1);
                debug!(event = "cache.hit", key = %key, "cache hit");
                Some(value)
            }
            Ok(None) => {
                counter!(METRIC_CACHE_MISS, "backend" => backend).increment(1);
                debug!(event = "cache.miss", key = %key, "cache miss");
                None
            }
            Err(err) => {
                self.record_error("get", &err);
                counter!(METRIC_CACHE_MISS, "backend" => backend).increment(1);
                None
            }
        }
    }

    /// Store `value` for `ttl`. Failures are logged and swallowed.
    pub async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) {
        if let Err(err) = self.backend.set(key.as_str(), value, ttl).await {
            self.record_error("set", &err);
        }
    }

    /// Store `value` from a detached task so the caller never waits on the
    /// backend.
    pub fn set_detached(&self, key: CacheKey, value: Bytes, ttl: Duration) {
        let cache = self.clone();
        tokio::spawn(async move {
            cache.set(&key, value, ttl).await;
        });
    }

    pub async fn delete(&self, key: &CacheKey) {
        if let Err(err) = self.backend.delete(key.as_str()).await {
            self.record_error("delete", &err);
        }
    }

    /// Remove every key beginning with `prefix`. Returns how many were
    /// removed; zero when the backend is unavailable.
    pub async fn delete_pattern(&self, prefix: &str) -> u64 {
        match self.backend.delete_prefix(prefix).await {
            Ok(removed) => {
                debug!(prefix, removed, "cache prefix invalidated");
                removed
            }
            Err(err) => {
                self.record_error("delete_pattern", &err);
                0
            }
        }
    }

    pub async fn invalidate(&self, scope: &CacheScope) -> u64 {
        self.delete_pattern(&scope.prefix()).await
    }

    /// Return the cached value for `key` or compute, store and return it.
    ///
    /// Concurrent misses on one key share a single `compute`. A failed
    /// computation is not cached; the next caller runs its own.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        self.compute_shared(key, ttl, compute).await
    }

    /// Typed lookup; an entry that no longer decodes is dropped and missed.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "discarding undecodable cache entry");
                self.delete(key).await;
                None
            }
        }
    }

    /// Typed [`get_or_compute`](Self::get_or_compute) over JSON encoding.
    pub async fn cached_json<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        if let Some(value) = self.get_json(key).await {
            return Ok(value);
        }

        let raw = self
            .compute_shared(key, ttl, || async move {
                let value = compute().await?;
                let encoded = serde_json::to_vec(&value).map_err(CacheError::from)?;
                Ok::<_, E>(Bytes::from(encoded))
            })
            .await?;
        serde_json::from_slice(&raw).map_err(|err| E::from(CacheError::from(err)))
    }

    /// Run `compute` once for every concurrent caller missing on `key` and
    /// store a successful result. When the leader fails, a waiting caller
    /// runs its own `compute`.
    pub(crate) async fn compute_shared<F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let flight = self
            .inflight
            .entry(key.as_str().to_string())
            .or_default()
            .clone();

        let result = flight
            .get_or_try_init(|| async {
                let value = compute().await?;
                self.set_detached(key.clone(), value.clone(), ttl);
                Ok::<_, E>(value)
            })
            .await
            .cloned();

        self.inflight
            .remove_if(key.as_str(), |_, current| Arc::ptr_eq(current, &flight));
        result
    }

    fn record_error(&self, op: &'static str, err: &CacheError) {
        counter!(METRIC_CACHE_ERROR, "backend" => self.backend.name(), "op" => op).increment(1);
        match err {
            CacheError::Unavailable { .. } => {
                debug!(event = "cache.unavailable", op, "cache backend unavailable")
            }
            _ if op == "set" => warn!(event = "cache.set_failed", error = %err, "cache write failed"),
            _ => warn!(event = "cache.error", op, error = %err, "cache call failed"),
        }
    }
}
