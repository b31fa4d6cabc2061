use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Method, Request, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use futures::future::join_all;
use serde_json::{Value, json};
use tenantry::{
    cache::{CACHE_STATUS_HEADER, CacheAside, CacheConfig, CacheLayerState, MemoryBackend},
    infra::http::{TENANT_HEADER, with_tenant_cache},
};
use tower::ServiceExt;

type Calls = Arc<AtomicUsize>;

async fn list_products(State(calls): State<Calls>) -> Json<Value> {
    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "call": call }))
}

async fn create_product(State(calls): State<Calls>) -> StatusCode {
    calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::CREATED
}

async fn reject_product() -> StatusCode {
    StatusCode::UNPROCESSABLE_ENTITY
}

async fn missing(State(calls): State<Calls>) -> StatusCode {
    calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND
}

async fn monthly_report(State(calls): State<Calls>) -> Json<Value> {
    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(Duration::from_millis(100)).await;
    Json(json!({ "report": "monthly", "call": call }))
}

async fn session(State(calls): State<Calls>) -> impl IntoResponse {
    calls.fetch_add(1, Ordering::SeqCst);
    ([(header::SET_COOKIE, "sid=abc")], "welcome")
}

struct App {
    router: Router,
    calls: Calls,
}

fn app() -> App {
    let calls: Calls = Arc::new(AtomicUsize::new(0));
    let routes = Router::new()
        .route("/products", get(list_products).post(create_product))
        .route("/products/invalid", post(reject_product))
        .route("/missing", get(missing))
        .route("/live/clock", get(list_products))
        .route("/session", get(session))
        .route("/reports", get(monthly_report))
        .with_state(calls.clone());

    let config = CacheConfig {
        default_ttl: Duration::from_secs(300),
        ..CacheConfig::default()
    }
    .with_route_ttls(&BTreeMap::from([("/live".to_string(), 0)]));
    let cache = CacheAside::new(Arc::new(MemoryBackend::new(
        NonZeroUsize::new(64).expect("non-zero"),
    )));

    App {
        router: with_tenant_cache(routes, CacheLayerState::new(cache, config)),
        calls,
    }
}

struct Reply {
    status: StatusCode,
    cache: Option<String>,
    body: String,
}

async fn send(app: &App, method: Method, uri: &str, tenant: Option<&str>) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(tenant) = tenant {
        builder = builder.header(TENANT_HEADER, tenant);
    }
    let request = builder.body(Body::empty()).expect("request builds");

    let response = app
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("router is infallible");
    let status = response.status();
    let cache = response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    Reply {
        status,
        cache,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

/// Let the detached cache store finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn repeated_get_is_served_from_cache() {
    let app = app();

    let first = send(&app, Method::GET, "/products", Some("acme")).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.cache.as_deref(), Some("miss"));
    settle().await;

    let second = send(&app, Method::GET, "/products", Some("acme")).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.cache.as_deref(), Some("hit"));
    assert_eq!(second.body, first.body);
    assert_eq!(app.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn query_parameter_order_maps_to_one_entry() {
    let app = app();

    send(&app, Method::GET, "/products?page=2&sort=name", Some("acme")).await;
    settle().await;
    let reordered = send(&app, Method::GET, "/products?sort=name&page=2", Some("acme")).await;

    assert_eq!(reordered.cache.as_deref(), Some("hit"));
    assert_eq!(app.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tenants_never_share_entries() {
    let app = app();

    send(&app, Method::GET, "/products", Some("acme")).await;
    settle().await;
    let other = send(&app, Method::GET, "/products", Some("other")).await;

    assert_eq!(other.cache.as_deref(), Some("miss"));
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn successful_write_invalidates_the_tenant() {
    let app = app();

    send(&app, Method::GET, "/products", Some("acme")).await;
    send(&app, Method::GET, "/products", Some("other")).await;
    settle().await;

    let created = send(&app, Method::POST, "/products", Some("acme")).await;
    assert_eq!(created.status, StatusCode::CREATED);

    let acme = send(&app, Method::GET, "/products", Some("acme")).await;
    assert_eq!(acme.cache.as_deref(), Some("miss"));
    let other = send(&app, Method::GET, "/products", Some("other")).await;
    assert_eq!(other.cache.as_deref(), Some("hit"));
}

#[tokio::test]
async fn failed_write_keeps_cached_reads() {
    let app = app();

    send(&app, Method::GET, "/products", Some("acme")).await;
    settle().await;

    let rejected = send(&app, Method::POST, "/products/invalid", Some("acme")).await;
    assert_eq!(rejected.status, StatusCode::UNPROCESSABLE_ENTITY);

    let again = send(&app, Method::GET, "/products", Some("acme")).await;
    assert_eq!(again.cache.as_deref(), Some("hit"));
}

#[tokio::test]
async fn error_responses_are_not_cached() {
    let app = app();

    for _ in 0..2 {
        let reply = send(&app, Method::GET, "/missing", Some("acme")).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(reply.cache.as_deref(), Some("miss"));
        settle().await;
    }
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn responses_setting_cookies_are_not_cached() {
    let app = app();

    for _ in 0..2 {
        let reply = send(&app, Method::GET, "/session", Some("acme")).await;
        assert_eq!(reply.cache.as_deref(), Some("miss"));
        settle().await;
    }
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn zero_ttl_routes_bypass_the_cache() {
    let app = app();

    for _ in 0..2 {
        let reply = send(&app, Method::GET, "/live/clock", Some("acme")).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.cache, None);
        settle().await;
    }
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn requests_without_a_tenant_pass_through() {
    let app = app();

    for _ in 0..2 {
        let reply = send(&app, Method::GET, "/products", None).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.cache, None);
        settle().await;
    }
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_tenant_is_rejected_before_the_handler() {
    let app = app();

    let reply = send(&app, Method::GET, "/products", Some("../etc/passwd")).await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_misses_run_the_handler_once() {
    let app = app();

    let replies = join_all((0..8).map(|_| send(&app, Method::GET, "/reports", Some("acme")))).await;

    assert_eq!(app.calls.load(Ordering::SeqCst), 1);
    assert!(replies.iter().all(|reply| reply.status == StatusCode::OK));
    assert!(replies.iter().all(|reply| reply.body == replies[0].body));
    let misses = replies
        .iter()
        .filter(|reply| reply.cache.as_deref() == Some("miss"))
        .count();
    let hits = replies
        .iter()
        .filter(|reply| reply.cache.as_deref() == Some("hit"))
        .count();
    assert_eq!((misses, hits), (1, 7));
}
