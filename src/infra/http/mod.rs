mod middleware;
mod ops;

pub use middleware::{TENANT_HEADER, log_responses, tenant_context};
pub use ops::{CACHE_BACKEND_HEADER, OpsState, build_ops_router};

use axum::{Router, http::StatusCode, middleware as axum_middleware};

use crate::{
    cache::{CacheLayerState, invalidate_writes, read_through},
    error::HttpError,
    pool::PoolError,
};

/// Map a pool error to a consistent HTTP error response.
pub fn pool_error_to_http(source: &'static str, err: PoolError) -> HttpError {
    match &err {
        PoolError::InvalidTenant { .. } => {
            HttpError::from_error(source, StatusCode::BAD_REQUEST, "Invalid tenant id", &err)
        }
        PoolError::Creation { .. } => HttpError::from_error(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            "Tenant storage unavailable",
            &err,
        ),
        PoolError::QueryExecution { .. } => HttpError::from_error(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Operation failed",
            &err,
        ),
        PoolError::Transaction { .. } => HttpError::from_error(
            source,
            StatusCode::CONFLICT,
            "Batch rolled back",
            &err,
        ),
        PoolError::Timeout { .. } => HttpError::from_error(
            source,
            StatusCode::GATEWAY_TIMEOUT,
            "Operation timed out",
            &err,
        ),
    }
}

/// Wrap tenant-facing routes with tenant resolution, write invalidation and
/// read-through caching, outermost first.
pub fn with_tenant_cache<S>(routes: Router<S>, cache: CacheLayerState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    routes
        .layer(axum_middleware::from_fn_with_state(cache.clone(), read_through))
        .layer(axum_middleware::from_fn_with_state(cache, invalidate_writes))
        .layer(axum_middleware::from_fn(tenant_context))
        .layer(axum_middleware::from_fn(log_responses))
}
