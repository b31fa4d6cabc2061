//! Read-through and write-invalidation middleware.
//!
//! Both layers find the tenant through the [`TenantId`] request extension
//! installed by the tenant-context layer; requests without one pass straight
//! through.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{error::HttpError, pool::TenantId};

use super::{
    CacheAside, CacheConfig,
    keys::{CacheKey, CacheScope},
};

pub const CACHE_STATUS_HEADER: &str = "x-cache";
const RESPONSE_KIND: &str = "response";

/// Shared state for both cache layers.
#[derive(Clone)]
pub struct CacheLayerState {
    pub cache: CacheAside,
    pub config: Arc<CacheConfig>,
}

impl CacheLayerState {
    pub fn new(cache: CacheAside, config: CacheConfig) -> Self {
        Self {
            cache,
            config: Arc::new(config),
        }
    }
}

/// Serve cacheable GET requests from the cache, populating it on a miss.
///
/// Only 2xx responses are stored, and only for routes with a non-zero TTL.
/// The store happens on a detached task after the response is ready.
/// Concurrent misses on one key run the handler once; a leader whose
/// response cannot be stored hands the next waiter its own handler run.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn read_through(
    State(state): State<CacheLayerState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }
    let Some(tenant) = request.extensions().get::<TenantId>().cloned() else {
        return next.run(request).await;
    };
    let Some(ttl) = state.config.ttl_for(request.uri().path()) else {
        return next.run(request).await;
    };

    let key = CacheKey::route(
        &tenant,
        RESPONSE_KIND,
        request.uri().path(),
        request.uri().query(),
    );

    if let Some(raw) = state.cache.get(&key).await {
        match serde_json::from_slice::<CachedResponse>(&raw) {
            Ok(cached) => match cached.into_response() {
                Some(response) => return with_cache_status(response, "hit"),
                None => warn!(key = %key, "cached response could not be rebuilt"),
            },
            Err(err) => warn!(key = %key, error = %err, "cached response could not be decoded"),
        }
        state.cache.delete(&key).await;
    }

    // Concurrent misses share one handler run. The leader keeps its own
    // response; followers rebuild theirs from the shared envelope.
    let mut led = None;
    let led_slot = &mut led;
    let shared = state
        .cache
        .compute_shared(&key, ttl, move || async move {
            let response = next.run(request).await;
            if !should_store_response(&response) {
                return Err(response);
            }
            match buffer_response(response).await {
                Ok((rebuilt, cached)) => match serde_json::to_vec(&cached) {
                    Ok(encoded) => {
                        *led_slot = Some(rebuilt);
                        Ok(Bytes::from(encoded))
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to encode response for cache");
                        Err(rebuilt)
                    }
                },
                Err((rebuilt, err)) => {
                    warn!(error = %err, "failed to buffer response for cache");
                    Err(rebuilt)
                }
            }
        })
        .await;

    match (shared, led) {
        (Err(response), _) | (Ok(_), Some(response)) => with_cache_status(response, "miss"),
        (Ok(raw), None) => match decode_shared(&raw) {
            Some(response) => with_cache_status(response, "hit"),
            None => HttpError::new(
                "cache::read_through",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Response unavailable",
                format!("shared response for `{key}` could not be rebuilt"),
            )
            .into_response(),
        },
    }
}

fn decode_shared(raw: &[u8]) -> Option<Response> {
    serde_json::from_slice::<CachedResponse>(raw)
        .ok()?
        .into_response()
}

/// After a successful mutating request, drop everything the tenant has
/// cached. Runs before the response is returned so the writer's next read
/// recomputes.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn invalidate_writes(
    State(state): State<CacheLayerState>,
    request: Request,
    next: Next,
) -> Response {
    if matches!(*request.method(), Method::GET | Method::HEAD) {
        return next.run(request).await;
    }
    let Some(tenant) = request.extensions().get::<TenantId>().cloned() else {
        return next.run(request).await;
    };

    let response = next.run(request).await;
    if response.status().is_success() {
        let removed = state.cache.invalidate(&CacheScope::Tenant(tenant.clone())).await;
        debug!(tenant_id = %tenant, removed, "invalidated tenant cache after write");
    }
    response
}

/// Response envelope as stored in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_body")]
    pub body: Bytes,
}

impl CachedResponse {
    fn from_parts(status: StatusCode, headers: &axum::http::HeaderMap, body: Bytes) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| name.as_str() != CACHE_STATUS_HEADER)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        Self {
            status: status.as_u16(),
            headers,
            body,
        }
    }

    fn into_response(self) -> Option<Response> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status).ok()?;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
            let value = HeaderValue::from_str(&value).ok()?;
            headers.append(name, value);
        }
        Some(response)
    }
}

mod base64_body {
    use base64::Engine as _;
    use serde::{Deserializer, Serializer};

    use super::*;

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Whether a response may be stored: 2xx, no cookies, not a stream.
pub fn should_store_response(response: &Response) -> bool {
    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    if response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    true
}

async fn buffer_response(
    response: Response,
) -> Result<(Response, CachedResponse), (Response, axum::Error)> {
    let (parts, body) = response.into_parts();
    match BodyExt::collect(body).await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let cached = CachedResponse::from_parts(parts.status, &parts.headers, bytes.clone());
            Ok((Response::from_parts(parts, Body::from(bytes)), cached))
        }
        Err(error) => Err((Response::from_parts(parts, Body::empty()), error)),
    }
}

fn with_cache_status(mut response: Response, status: &'static str) -> Response {
    response.headers_mut().insert(
        HeaderName::from_static(CACHE_STATUS_HEADER),
        HeaderValue::from_static(status),
    );
    response
}
