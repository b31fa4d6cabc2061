//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheBackendKind;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tenantry";
const ENV_PREFIX: &str = "TENANTRY";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORAGE_ROOT: &str = "data/tenants";
const DEFAULT_MAX_RESIDENT: u64 = 256;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_CONNECTIONS: u64 = 4;
const DEFAULT_CACHE_KEY_PREFIX: &str = "tenantry:";
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_MEMORY_CAPACITY: u64 = 10_000;
const DEFAULT_CACHE_RECONNECT_MIN_MS: u64 = 100;
const DEFAULT_CACHE_RECONNECT_MAX_MS: u64 = 30_000;

/// Command-line arguments for the tenantry binary.
#[derive(Debug, Parser)]
#[command(
    name = "tenantry",
    version,
    about = "Per-tenant storage pools behind a cache-aside layer"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TENANTRY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the tenantry service.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the directory holding tenant databases.
    #[arg(long = "pools-storage-root", value_name = "PATH")]
    pub pools_storage_root: Option<PathBuf>,

    /// Override the advisory ceiling on resident pools.
    #[arg(long = "pools-max-resident", value_name = "COUNT")]
    pub pools_max_resident: Option<u64>,

    /// Override the default operation timeout.
    #[arg(long = "pools-operation-timeout-ms", value_name = "MILLIS")]
    pub pools_operation_timeout_ms: Option<u64>,

    /// Override how long a pool may sit idle before eviction.
    #[arg(long = "pools-idle-threshold-seconds", value_name = "SECONDS")]
    pub pools_idle_threshold_seconds: Option<u64>,

    /// Override the idle sweep cadence.
    #[arg(long = "pools-sweep-interval-seconds", value_name = "SECONDS")]
    pub pools_sweep_interval_seconds: Option<u64>,

    /// Override the cache backend (memory|redis|disabled).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the Redis connection URL.
    #[arg(long = "cache-redis-url", value_name = "URL")]
    pub cache_redis_url: Option<String>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub pools: PoolSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub storage_root: PathBuf,
    pub max_resident: NonZeroUsize,
    pub operation_timeout: Duration,
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
    pub busy_timeout: Duration,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackendKind,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    /// Zero disables caching for routes without a table entry.
    pub default_ttl_seconds: u64,
    pub route_ttls: BTreeMap<String, u64>,
    pub memory_capacity: NonZeroUsize,
    pub reconnect_min_ms: NonZeroU64,
    pub reconnect_max_ms: NonZeroU64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    pools: RawPoolSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(root) = overrides.pools_storage_root.as_ref() {
            self.pools.storage_root = Some(root.clone());
        }
        if let Some(max) = overrides.pools_max_resident {
            self.pools.max_resident = Some(max);
        }
        if let Some(millis) = overrides.pools_operation_timeout_ms {
            self.pools.operation_timeout_ms = Some(millis);
        }
        if let Some(seconds) = overrides.pools_idle_threshold_seconds {
            self.pools.idle_threshold_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.pools_sweep_interval_seconds {
            self.pools.sweep_interval_seconds = Some(seconds);
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.cache_redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            pools,
            cache,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            pools: build_pool_settings(pools)?,
            cache: build_cache_settings(cache)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);

    Ok(ServerSettings {
        addr,
        graceful_shutdown: non_zero_duration(
            graceful_secs,
            Duration::from_secs,
            "server.graceful_shutdown_seconds",
        )?,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_pool_settings(pools: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let storage_root = pools
        .storage_root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
    if storage_root.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "pools.storage_root",
            "path must not be empty",
        ));
    }

    Ok(PoolSettings {
        storage_root,
        max_resident: non_zero_usize(
            pools.max_resident.unwrap_or(DEFAULT_MAX_RESIDENT),
            "pools.max_resident",
        )?,
        operation_timeout: non_zero_duration(
            pools
                .operation_timeout_ms
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS),
            Duration::from_millis,
            "pools.operation_timeout_ms",
        )?,
        idle_threshold: non_zero_duration(
            pools
                .idle_threshold_seconds
                .unwrap_or(DEFAULT_IDLE_THRESHOLD_SECS),
            Duration::from_secs,
            "pools.idle_threshold_seconds",
        )?,
        sweep_interval: non_zero_duration(
            pools
                .sweep_interval_seconds
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            Duration::from_secs,
            "pools.sweep_interval_seconds",
        )?,
        shutdown_grace: non_zero_duration(
            pools
                .shutdown_grace_seconds
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            Duration::from_secs,
            "pools.shutdown_grace_seconds",
        )?,
        busy_timeout: non_zero_duration(
            pools.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
            Duration::from_millis,
            "pools.busy_timeout_ms",
        )?,
        max_connections: non_zero_u32(
            pools.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            "pools.max_connections",
        )?,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend.as_deref().map(str::trim) {
        None | Some("memory") => CacheBackendKind::Memory,
        Some("redis") => CacheBackendKind::Redis,
        Some("disabled") => CacheBackendKind::Disabled,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}` (expected memory, redis or disabled)"),
            ));
        }
    };

    let redis_url = cache.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if backend == CacheBackendKind::Redis && redis_url.is_none() {
        return Err(LoadError::invalid(
            "cache.redis_url",
            "required when cache.backend is `redis`",
        ));
    }

    let reconnect_min_ms = non_zero_u64(
        cache
            .reconnect_min_ms
            .unwrap_or(DEFAULT_CACHE_RECONNECT_MIN_MS),
        "cache.reconnect_min_ms",
    )?;
    let reconnect_max_ms = non_zero_u64(
        cache
            .reconnect_max_ms
            .unwrap_or(DEFAULT_CACHE_RECONNECT_MAX_MS),
        "cache.reconnect_max_ms",
    )?;
    if reconnect_max_ms < reconnect_min_ms {
        return Err(LoadError::invalid(
            "cache.reconnect_max_ms",
            "must not be smaller than cache.reconnect_min_ms",
        ));
    }

    for prefix in cache.route_ttls.keys() {
        if !prefix.starts_with('/') {
            return Err(LoadError::invalid(
                "cache.route_ttls",
                format!("route prefix `{prefix}` must start with `/`"),
            ));
        }
    }

    Ok(CacheSettings {
        backend,
        redis_url,
        key_prefix: cache
            .key_prefix
            .unwrap_or_else(|| DEFAULT_CACHE_KEY_PREFIX.to_string()),
        default_ttl_seconds: cache.default_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        route_ttls: cache.route_ttls,
        memory_capacity: non_zero_usize(
            cache
                .memory_capacity
                .unwrap_or(DEFAULT_CACHE_MEMORY_CAPACITY),
            "cache.memory_capacity",
        )?,
        reconnect_min_ms,
        reconnect_max_ms,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    storage_root: Option<PathBuf>,
    max_resident: Option<u64>,
    operation_timeout_ms: Option<u64>,
    idle_threshold_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    shutdown_grace_seconds: Option<u64>,
    busy_timeout_ms: Option<u64>,
    max_connections: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    redis_url: Option<String>,
    key_prefix: Option<String>,
    default_ttl_seconds: Option<u64>,
    route_ttls: BTreeMap<String, u64>,
    memory_capacity: Option<u64>,
    reconnect_min_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_duration(
    value: u64,
    unit: fn(u64) -> Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn from_toml(source: &str) -> Result<Settings, LoadError> {
        let raw: RawSettings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Settings::from_raw(raw)
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 3000);
        assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
        assert_eq!(settings.pools.storage_root, PathBuf::from("data/tenants"));
        assert_eq!(settings.pools.max_resident.get(), 256);
        assert_eq!(settings.pools.operation_timeout, Duration::from_secs(30));
        assert_eq!(settings.pools.idle_threshold, Duration::from_secs(1800));
        assert_eq!(settings.pools.sweep_interval, Duration::from_secs(300));
        assert_eq!(settings.pools.shutdown_grace, Duration::from_secs(10));
        assert_eq!(settings.cache.backend, CacheBackendKind::Memory);
        assert_eq!(settings.cache.key_prefix, "tenantry:");
        assert_eq!(settings.cache.default_ttl_seconds, 300);
        assert!(settings.cache.route_ttls.is_empty());
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.pools.idle_threshold_seconds = Some(60);

        let overrides = ServeOverrides {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            pools_idle_threshold_seconds: Some(120),
            ..Default::default()
        };
        raw.apply_serve_overrides(&overrides);

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.pools.idle_threshold, Duration::from_secs(120));
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };
        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let mut raw = RawSettings::default();
        raw.pools.operation_timeout_ms = Some(0);
        let err = Settings::from_raw(raw).expect_err("zero timeout");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "pools.operation_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn redis_backend_requires_url() {
        let mut raw = RawSettings::default();
        raw.cache.backend = Some("redis".to_string());
        let err = Settings::from_raw(raw).expect_err("missing url");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "cache.redis_url",
                ..
            }
        ));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut raw = RawSettings::default();
        raw.cache.backend = Some("memcached".to_string());
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn route_ttls_load_from_file() {
        let settings = from_toml(
            r#"
            [cache]
            backend = "redis"
            redis_url = "redis://127.0.0.1:6379/0"
            default_ttl_seconds = 120

            [cache.route_ttls]
            "/reports" = 60
            "/reports/live" = 0
            "#,
        )
        .expect("valid settings");

        assert_eq!(settings.cache.backend, CacheBackendKind::Redis);
        assert_eq!(settings.cache.default_ttl_seconds, 120);
        assert_eq!(settings.cache.route_ttls.get("/reports"), Some(&60));
        assert_eq!(settings.cache.route_ttls.get("/reports/live"), Some(&0));
    }

    #[test]
    fn route_prefix_must_be_a_path() {
        let mut raw = RawSettings::default();
        raw.cache.route_ttls.insert("reports".to_string(), 10);
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["tenantry"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_serve_arguments() {
        let args = CliArgs::parse_from([
            "tenantry",
            "serve",
            "--pools-storage-root",
            "/var/lib/tenantry",
            "--cache-backend",
            "disabled",
        ]);
        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(
                    serve.overrides.pools_storage_root.as_deref(),
                    Some(std::path::Path::new("/var/lib/tenantry"))
                );
                assert_eq!(serve.overrides.cache_backend.as_deref(), Some("disabled"));
            }
        }
    }
}
