//! Operational endpoints: liveness, pool statistics, probes and cache purges.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;

use crate::{
    cache::{CacheAside, CacheScope},
    error::HttpError,
    pool::{PoolHealth, PoolManager, PoolStats, TenantId},
};

use super::{log_responses, pool_error_to_http};

pub const CACHE_BACKEND_HEADER: &str = "x-cache-backend";

#[derive(Clone)]
pub struct OpsState {
    pub pools: Arc<PoolManager>,
    pub cache: CacheAside,
}

pub fn build_ops_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pools", get(list_pools))
        .route("/pools/{tenant}", get(pool_stats))
        .route("/pools/{tenant}/health", post(check_pool_health))
        .route("/cache/tenants/{tenant}", delete(purge_tenant_cache))
        .layer(axum::middleware::from_fn(log_responses))
        .with_state(state)
}

async fn health(State(state): State<OpsState>) -> Response {
    let status = if state.cache.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("{}; {status}", state.cache.backend_name())) {
        response.headers_mut().insert(CACHE_BACKEND_HEADER, value);
    }
    response
}

async fn list_pools(State(state): State<OpsState>) -> Json<Vec<PoolStats>> {
    Json(state.pools.stats())
}

async fn pool_stats(
    State(state): State<OpsState>,
    Path(tenant): Path<String>,
) -> Result<Json<PoolStats>, HttpError> {
    let tenant = parse_tenant("infra::http::ops::pool_stats", tenant)?;
    state.pools.stats_for(&tenant).map(Json).ok_or_else(|| {
        HttpError::new(
            "infra::http::ops::pool_stats",
            StatusCode::NOT_FOUND,
            "Pool not resident",
            format!("tenant `{tenant}` has no resident pool"),
        )
    })
}

#[derive(Debug, Serialize)]
struct HealthCheckResponse {
    tenant_id: TenantId,
    health: PoolHealth,
}

async fn check_pool_health(
    State(state): State<OpsState>,
    Path(tenant): Path<String>,
) -> Result<Json<HealthCheckResponse>, HttpError> {
    const SOURCE: &str = "infra::http::ops::check_pool_health";
    let tenant = parse_tenant(SOURCE, tenant)?;
    let Some(health) = state.pools.health_check(&tenant).await else {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Pool not resident",
            format!("tenant `{tenant}` has no resident pool"),
        ));
    };
    Ok(Json(HealthCheckResponse {
        tenant_id: tenant,
        health,
    }))
}

#[derive(Debug, Serialize)]
struct PurgeResponse {
    tenant_id: TenantId,
    removed: u64,
}

async fn purge_tenant_cache(
    State(state): State<OpsState>,
    Path(tenant): Path<String>,
) -> Result<Json<PurgeResponse>, HttpError> {
    let tenant = parse_tenant("infra::http::ops::purge_tenant_cache", tenant)?;
    let removed = state
        .cache
        .invalidate(&CacheScope::Tenant(tenant.clone()))
        .await;
    Ok(Json(PurgeResponse {
        tenant_id: tenant,
        removed,
    }))
}

fn parse_tenant(source: &'static str, raw: String) -> Result<TenantId, HttpError> {
    TenantId::parse(raw).map_err(|err| pool_error_to_http(source, err))
}
