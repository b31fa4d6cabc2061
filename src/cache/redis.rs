//! Remote cache backend over Redis.
//!
//! The backend never fails the process because Redis is down. A supervisor
//! task owns reconnection: it retries with exponential backoff while the
//! backend is disconnected and sleeps otherwise. Commands issued while
//! disconnected report [`CacheError::Unavailable`], which the aside layer
//! treats as a miss.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use redis::{
    AsyncCommands, RedisError,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::util::lock::mutex_lock;

use super::{backend::CacheBackend, error::CacheError};

const SOURCE: &str = "cache::redis";
const BACKEND: &str = "redis";
const SCAN_BATCH: usize = 200;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

pub const METRIC_CACHE_RECONNECT: &str = "tenantry_cache_reconnect_total";

#[derive(Debug, Clone)]
pub struct RedisOptions {
    pub url: String,
    /// Prepended to every key this backend touches.
    pub key_prefix: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

struct Shared {
    client: redis::Client,
    options: RedisOptions,
    connection: Mutex<Option<ConnectionManager>>,
    connected: AtomicBool,
    wake: Notify,
}

/// Redis-backed [`CacheBackend`]. Cheap to clone.
#[derive(Clone)]
pub struct RedisBackend {
    shared: Arc<Shared>,
}

impl RedisBackend {
    /// Build the backend and try one connection.
    ///
    /// Only an unparsable URL is an error; an unreachable server leaves the
    /// backend disconnected until [`spawn_supervisor`](Self::spawn_supervisor)
    /// brings it up.
    pub async fn connect(options: RedisOptions) -> Result<Self, CacheError> {
        let client = redis::Client::open(options.url.as_str()).map_err(|err| CacheError::Backend {
            backend: BACKEND,
            message: format!("invalid redis url: {err}"),
        })?;

        let backend = Self {
            shared: Arc::new(Shared {
                client,
                options,
                connection: Mutex::new(None),
                connected: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        };

        if let Err(err) = backend.try_connect().await {
            warn!(
                event = "cache.unavailable",
                error = %err,
                "redis unreachable at startup, serving without cache"
            );
        }
        Ok(backend)
    }

    /// Keep the connection alive until the returned task is aborted.
    pub fn spawn_supervisor(&self) -> JoinHandle<()> {
        let backend = self.clone();
        tokio::spawn(async move {
            let min = backend.shared.options.reconnect_min;
            let max = backend.shared.options.reconnect_max;
            let mut delay = min;
            loop {
                if backend.is_connected() {
                    delay = min;
                    backend.shared.wake.notified().await;
                    continue;
                }

                tokio::time::sleep(delay).await;
                counter!(METRIC_CACHE_RECONNECT).increment(1);
                match backend.try_connect().await {
                    Ok(()) => delay = min,
                    Err(err) => {
                        debug!(error = %err, retry_in_ms = delay.as_millis() as u64, "redis reconnect failed");
                        delay = next_backoff(delay, max);
                    }
                }
            }
        })
    }

    async fn try_connect(&self) -> Result<(), RedisError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT);
        let manager = ConnectionManager::new_with_config(self.shared.client.clone(), config).await?;

        *mutex_lock(&self.shared.connection, SOURCE, "try_connect") = Some(manager);
        self.shared.connected.store(true, Ordering::Release);
        info!(event = "cache.connected", backend = BACKEND, "cache backend connected");
        Ok(())
    }

    fn connection(&self) -> Result<ConnectionManager, CacheError> {
        if !self.is_connected() {
            return Err(CacheError::Unavailable { backend: BACKEND });
        }
        mutex_lock(&self.shared.connection, SOURCE, "connection")
            .clone()
            .ok_or(CacheError::Unavailable { backend: BACKEND })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{key}", self.shared.options.key_prefix)
    }

    fn fail(&self, err: RedisError) -> CacheError {
        if is_connection_fault(&err) {
            self.mark_disconnected();
            return CacheError::Unavailable { backend: BACKEND };
        }
        CacheError::Backend {
            backend: BACKEND,
            message: err.to_string(),
        }
    }

    fn mark_disconnected(&self) {
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            mutex_lock(&self.shared.connection, SOURCE, "mark_disconnected").take();
            warn!(event = "cache.disconnected", backend = BACKEND, "cache backend disconnected");
            self.shared.wake.notify_one();
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.connection()?;
        let value: Option<Vec<u8>> = conn
            .get(self.prefixed(key))
            .await
            .map_err(|err| self.fail(err))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let millis = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        conn.pset_ex::<_, _, ()>(self.prefixed(key), &value[..], millis)
            .await
            .map_err(|err| self.fail(err))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        conn.del::<_, ()>(self.prefixed(key))
            .await
            .map_err(|err| self.fail(err))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection()?;
        let pattern = format!("{}*", escape_glob(&self.prefixed(prefix)));
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|err| self.fail(err))?;

            if !keys.is_empty() {
                let count: u64 = conn.del(&keys).await.map_err(|err| self.fail(err))?;
                removed += count;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }
}

fn is_connection_fault(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

/// Escape Redis glob metacharacters so a prefix matches only itself.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
