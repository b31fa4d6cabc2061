use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    cache::{METRIC_CACHE_ERROR, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_RECONNECT},
    config::{LogFormat, LoggingSettings},
    pool::{
        METRIC_OPERATION_ERROR, METRIC_OPERATION_MS, METRIC_OPERATION_TIMEOUT,
        METRIC_POOL_CREATED, METRIC_POOL_CREATION_FAILED, METRIC_POOL_EVICTED,
        METRIC_POOL_RESIDENT,
    },
};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// `RUST_LOG` directives win over the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the crate emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_POOL_CREATED,
            Unit::Count,
            "Tenant pools created."
        );
        describe_counter!(
            METRIC_POOL_CREATION_FAILED,
            Unit::Count,
            "Tenant pool creations that failed to open storage."
        );
        describe_counter!(
            METRIC_POOL_EVICTED,
            Unit::Count,
            "Tenant pools evicted after sitting idle."
        );
        describe_gauge!(
            METRIC_POOL_RESIDENT,
            Unit::Count,
            "Tenant pools currently resident."
        );
        describe_counter!(
            METRIC_OPERATION_ERROR,
            Unit::Count,
            "Operations and batches that failed against a live pool."
        );
        describe_counter!(
            METRIC_OPERATION_TIMEOUT,
            Unit::Count,
            "Operations and batches abandoned at their timeout."
        );
        describe_histogram!(
            METRIC_OPERATION_MS,
            Unit::Milliseconds,
            "Operation latency in milliseconds, labelled by kind."
        );
        describe_counter!(METRIC_CACHE_HIT, Unit::Count, "Cache lookups served from the backend.");
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Cache lookups that fell through to computation."
        );
        describe_counter!(
            METRIC_CACHE_ERROR,
            Unit::Count,
            "Cache backend calls that failed or found the backend unavailable."
        );
        describe_counter!(
            METRIC_CACHE_RECONNECT,
            Unit::Count,
            "Reconnect attempts made by the cache supervisor."
        );
    });
}
