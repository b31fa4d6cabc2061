//! Pool manager configuration.

use std::{path::PathBuf, time::Duration};

const DEFAULT_STORAGE_ROOT: &str = "data/tenants";
const DEFAULT_MAX_RESIDENT: usize = 256;
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Directory holding one database file per tenant.
    pub storage_root: PathBuf,
    /// Advisory ceiling on resident pools; exceeding it only logs.
    pub max_resident: usize,
    /// Default bound for `execute` and `run_batch`.
    pub operation_timeout: Duration,
    /// A pool idle for longer than this is evicted by the sweeper.
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
    /// How long shutdown waits for in-flight operations per pool.
    pub shutdown_grace: Duration,
    pub busy_timeout: Duration,
    /// Connections per tenant handle.
    pub max_connections: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            max_resident: DEFAULT_MAX_RESIDENT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl From<&crate::config::PoolSettings> for PoolConfig {
    fn from(settings: &crate::config::PoolSettings) -> Self {
        Self {
            storage_root: settings.storage_root.clone(),
            max_resident: settings.max_resident.get(),
            operation_timeout: settings.operation_timeout,
            idle_threshold: settings.idle_threshold,
            sweep_interval: settings.sweep_interval,
            shutdown_grace: settings.shutdown_grace,
            busy_timeout: settings.busy_timeout,
            max_connections: settings.max_connections.get(),
        }
    }
}

impl PoolConfig {
    /// Configuration rooted at `storage_root` with every other value defaulted.
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = PoolConfig::default();
        assert_eq!(config.storage_root, PathBuf::from("data/tenants"));
        assert_eq!(config.max_resident, 256);
        assert_eq!(config.operation_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_threshold, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.max_connections, 4);
    }
}
