use std::{
    convert::Infallible,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tenantry::{
    cache::{CacheAside, CacheBackend, CacheError, CacheKey, CacheScope, MemoryBackend},
    pool::TenantId,
};

/// A backend that is always down.
struct UnreachableBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl CacheBackend for UnreachableBackend {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Unavailable {
            backend: "unreachable",
        })
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Backend {
            backend: "unreachable",
            message: "connection refused".to_string(),
        })
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Unavailable {
            backend: "unreachable",
        })
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
        Err(CacheError::Unavailable {
            backend: "unreachable",
        })
    }
}

fn memory_cache() -> CacheAside {
    CacheAside::new(Arc::new(MemoryBackend::new(
        NonZeroUsize::new(128).expect("non-zero"),
    )))
}

fn tenant(raw: &str) -> TenantId {
    TenantId::parse(raw).expect("valid tenant id")
}

#[tokio::test]
async fn stored_values_are_served_until_deleted() {
    let cache = memory_cache();
    let key = CacheKey::tenant(&tenant("acme"), "products", "list?page=1");

    assert_eq!(cache.get(&key).await, None);
    cache
        .set(&key, Bytes::from_static(b"[1,2,3]"), Duration::from_secs(60))
        .await;
    assert_eq!(cache.get(&key).await, Some(Bytes::from_static(b"[1,2,3]")));

    cache.delete(&key).await;
    assert_eq!(cache.get(&key).await, None);
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_their_ttl() {
    let cache = memory_cache();
    let key = CacheKey::tenant(&tenant("acme"), "products", "list");
    cache
        .set(&key, Bytes::from_static(b"v"), Duration::from_secs(60))
        .await;

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(cache.get(&key).await.is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.get(&key).await.is_none());
}

#[tokio::test]
async fn prefix_delete_is_confined_to_the_tenant() {
    let cache = memory_cache();
    let acme = tenant("acme");
    let other = tenant("other");
    let ttl = Duration::from_secs(60);

    let acme_keys = [
        CacheKey::tenant(&acme, "products", "a"),
        CacheKey::tenant(&acme, "orders", "b"),
    ];
    let other_key = CacheKey::tenant(&other, "products", "a");
    for key in acme_keys.iter().chain([&other_key]) {
        cache.set(key, Bytes::from_static(b"x"), ttl).await;
    }

    let removed = cache.delete_pattern("tenant:acme:").await;
    assert_eq!(removed, 2);
    for key in &acme_keys {
        assert!(cache.get(key).await.is_none());
    }
    assert!(cache.get(&other_key).await.is_some());

    assert_eq!(cache.invalidate(&CacheScope::Tenant(other)).await, 1);
    assert!(cache.get(&other_key).await.is_none());
}

#[tokio::test]
async fn resource_scope_leaves_other_kinds_alone() {
    let cache = memory_cache();
    let acme = tenant("acme");
    let ttl = Duration::from_secs(60);
    let products = CacheKey::tenant(&acme, "products", "a");
    let orders = CacheKey::tenant(&acme, "orders", "a");
    cache.set(&products, Bytes::from_static(b"p"), ttl).await;
    cache.set(&orders, Bytes::from_static(b"o"), ttl).await;

    let removed = cache
        .invalidate(&CacheScope::TenantResource {
            tenant: acme,
            kind: "products".to_string(),
        })
        .await;

    assert_eq!(removed, 1);
    assert!(cache.get(&products).await.is_none());
    assert!(cache.get(&orders).await.is_some());
}

#[tokio::test]
async fn concurrent_misses_share_one_computation() {
    let cache = memory_cache();
    let key = CacheKey::tenant(&tenant("acme"), "report", "monthly");
    let computed = Arc::new(AtomicUsize::new(0));

    let calls = (0..10).map(|_| {
        let computed = computed.clone();
        cache.get_or_compute(&key, Duration::from_secs(60), move || async move {
            computed.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, Infallible>(Bytes::from_static(b"expensive"))
        })
    });
    let results = join_all(calls).await;

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert!(
        results
            .into_iter()
            .all(|result| result == Ok(Bytes::from_static(b"expensive")))
    );
}

#[tokio::test]
async fn computed_value_is_stored_for_later_reads() {
    let cache = memory_cache();
    let key = CacheKey::tenant(&tenant("acme"), "report", "weekly");

    let value = cache
        .get_or_compute(&key, Duration::from_secs(60), || async {
            Ok::<_, Infallible>(Bytes::from_static(b"fresh"))
        })
        .await
        .expect("infallible");
    assert_eq!(value, Bytes::from_static(b"fresh"));

    // The store runs on a detached task.
    let mut stored = None;
    for _ in 0..100 {
        stored = cache.get(&key).await;
        if stored.is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(stored, Some(Bytes::from_static(b"fresh")));

    let again = cache
        .get_or_compute(&key, Duration::from_secs(60), || async {
            Err::<Bytes, &str>("must not recompute")
        })
        .await;
    assert_eq!(again, Ok(Bytes::from_static(b"fresh")));
}

#[tokio::test]
async fn unreachable_backend_degrades_to_direct_computation() {
    let backend = Arc::new(UnreachableBackend {
        calls: AtomicUsize::new(0),
    });
    let cache = CacheAside::new(backend.clone());
    let key = CacheKey::tenant(&tenant("acme"), "products", "list");
    let computed = AtomicUsize::new(0);

    for _ in 0..3 {
        let value = cache
            .get_or_compute(&key, Duration::from_secs(60), || async {
                computed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Bytes::from_static(b"live"))
            })
            .await
            .expect("infallible");
        assert_eq!(value, Bytes::from_static(b"live"));
    }

    assert_eq!(computed.load(Ordering::SeqCst), 3);
    assert!(backend.calls.load(Ordering::SeqCst) >= 3);
    assert!(!cache.is_connected());
    assert_eq!(cache.delete_pattern("tenant:acme:").await, 0);
}

#[tokio::test]
async fn compute_errors_reach_the_caller() {
    let cache = memory_cache();
    let key = CacheKey::tenant(&tenant("acme"), "products", "broken");

    let result = cache
        .get_or_compute(&key, Duration::from_secs(60), || async {
            Err::<Bytes, String>("database unavailable".to_string())
        })
        .await;

    assert_eq!(result, Err("database unavailable".to_string()));
    assert!(cache.get(&key).await.is_none());
}

#[tokio::test]
async fn scope_invalidation_stops_at_the_segment_boundary() {
    let cache = memory_cache();
    let ttl = Duration::from_secs(60);
    let nested_user = CacheKey::user("a:b", "profile", "/me");
    let archived = CacheKey::tenant(&tenant("acme"), "orders:archive", "list");
    cache.set(&nested_user, Bytes::from_static(b"u"), ttl).await;
    cache.set(&archived, Bytes::from_static(b"o"), ttl).await;

    assert_eq!(cache.invalidate(&CacheScope::User("a".to_string())).await, 0);
    let removed = cache
        .invalidate(&CacheScope::TenantResource {
            tenant: tenant("acme"),
            kind: "orders".to_string(),
        })
        .await;
    assert_eq!(removed, 0);

    assert!(cache.get(&nested_user).await.is_some());
    assert!(cache.get(&archived).await.is_some());
    assert_eq!(cache.invalidate(&CacheScope::User("a:b".to_string())).await, 1);
}
