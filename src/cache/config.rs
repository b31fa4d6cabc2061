//! Cache configuration.

use std::{collections::BTreeMap, num::NonZeroUsize, time::Duration};

use serde::Deserialize;

const DEFAULT_KEY_PREFIX: &str = "tenantry:";
const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_RECONNECT_MIN: Duration = Duration::from_millis(100);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Redis,
    Disabled,
}

impl CacheBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheBackendKind::Memory => "memory",
            CacheBackendKind::Redis => "redis",
            CacheBackendKind::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    /// TTL for routes with no more specific entry.
    pub default_ttl: Duration,
    /// Path prefix → TTL, longest prefix first. A zero TTL disables caching.
    pub route_ttls: Vec<(String, Duration)>,
    pub memory_capacity: NonZeroUsize,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl: DEFAULT_TTL,
            route_ttls: Vec::new(),
            memory_capacity: NonZeroUsize::new(DEFAULT_MEMORY_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            reconnect_min: DEFAULT_RECONNECT_MIN,
            reconnect_max: DEFAULT_RECONNECT_MAX,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            backend: settings.backend,
            redis_url: settings.redis_url.clone(),
            key_prefix: settings.key_prefix.clone(),
            default_ttl: Duration::from_secs(settings.default_ttl_seconds),
            route_ttls: sort_route_ttls(&settings.route_ttls),
            memory_capacity: settings.memory_capacity,
            reconnect_min: Duration::from_millis(settings.reconnect_min_ms.get()),
            reconnect_max: Duration::from_millis(settings.reconnect_max_ms.get()),
        }
    }
}

impl CacheConfig {
    /// Replace the route table, keeping longest-prefix-first order.
    pub fn with_route_ttls(mut self, routes: &BTreeMap<String, u64>) -> Self {
        self.route_ttls = sort_route_ttls(routes);
        self
    }

    /// TTL for `path`, or `None` when caching is disabled for it. Route
    /// prefixes match whole path segments only.
    pub fn ttl_for(&self, path: &str) -> Option<Duration> {
        let ttl = self
            .route_ttls
            .iter()
            .find(|(prefix, _)| covers(prefix, path))
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl);
        (!ttl.is_zero()).then_some(ttl)
    }
}

fn covers(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

fn sort_route_ttls(routes: &BTreeMap<String, u64>) -> Vec<(String, Duration)> {
    let mut sorted: Vec<(String, Duration)> = routes
        .iter()
        .map(|(prefix, secs)| (prefix.clone(), Duration::from_secs(*secs)))
        .collect();
    sorted.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    sorted
}
