//! End-to-end behaviour of the cacheable and write-invalidation layers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    routing::get,
};
use balcao::application::repos::{EndpointConfigRepo, EndpointConfigUpsert};
use balcao::cache::{
    BackgroundTasks, CacheConfig, CacheLayerState, CacheStore, DistributedTier, EventKind,
    EventQueue, MemoryTier, PolicyResolver, WarmupJob, cacheable, invalidate_on_write,
};
use balcao::infra::memory::MemoryConfigStore;
use tower::ServiceExt;

struct Harness {
    store: Arc<CacheStore>,
    configs: Arc<MemoryConfigStore>,
    events: Arc<EventQueue>,
    tasks: BackgroundTasks,
    layer: CacheLayerState,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    fn new(distributed: Option<Arc<MemoryTier>>) -> Self {
        let config = CacheConfig::default();
        let events = Arc::new(EventQueue::new());
        let tasks = BackgroundTasks::new();
        let mut store = CacheStore::new(&config, events.clone(), tasks.clone());
        if let Some(tier) = distributed {
            let tier: Arc<dyn DistributedTier> = tier;
            store = store.with_distributed(tier);
        }
        let store = Arc::new(store);
        let configs = Arc::new(MemoryConfigStore::new());
        let policies = Arc::new(PolicyResolver::new(configs.clone(), Duration::ZERO));
        let layer = CacheLayerState::new(store.clone(), policies, &config);

        Self {
            store,
            configs,
            events,
            tasks,
            layer,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `GET /api/produtos` cached with `ttl`, `POST /api/produtos` busting
    /// the `produtos` namespace.
    fn produtos_router(&self, ttl: Duration) -> Router {
        let calls = self.calls.clone();
        let routes = Router::new().route(
            "/api/produtos",
            get(move || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    format!("{{\"version\":{n}}}")
                }
            })
            .post(|| async { StatusCode::CREATED }),
        );

        invalidate_on_write(
            cacheable(routes, &self.layer, ttl),
            self.store.clone(),
            &["produtos"],
        )
    }

    fn handler_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Option<String>, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let x_cache = response
        .headers()
        .get("x-cache")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect");
    (
        status,
        x_cache,
        String::from_utf8(body.to_vec()).expect("utf-8 body"),
    )
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_their_ttl() {
    let harness = Harness::new(None);
    let app = harness.produtos_router(Duration::from_millis(1_000));

    let (_, first, body) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(first.as_deref(), Some("MISS"));
    assert_eq!(body, "{\"version\":1}");

    tokio::time::advance(Duration::from_millis(500)).await;
    let (_, second, body) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(second.as_deref(), Some("HIT"));
    assert_eq!(body, "{\"version\":1}");
    assert_eq!(harness.handler_calls(), 1);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    let (_, third, body) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(third.as_deref(), Some("MISS"));
    assert_eq!(body, "{\"version\":2}");
    assert_eq!(harness.handler_calls(), 2);
}

#[tokio::test]
async fn successful_writes_bust_the_namespace() {
    let harness = Harness::new(None);
    let app = harness.produtos_router(Duration::from_secs(60));

    send(&app, Method::GET, "/api/produtos").await;
    let (_, cached, _) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(cached.as_deref(), Some("HIT"));

    let (status, _, _) = send(&app, Method::POST, "/api/produtos").await;
    assert_eq!(status, StatusCode::CREATED);
    harness.tasks.drained().await;

    let (_, after_write, body) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(after_write.as_deref(), Some("MISS"));
    assert_eq!(body, "{\"version\":2}");

    let invalidations: Vec<_> = harness
        .events
        .recent(16)
        .into_iter()
        .filter_map(|event| match event.kind {
            EventKind::PatternInvalidated { pattern, matched } => Some((pattern, matched)),
            _ => None,
        })
        .collect();
    assert_eq!(invalidations, vec![("produtos".to_string(), 1)]);
}

#[tokio::test]
async fn failed_writes_leave_the_cache_alone() {
    let harness = Harness::new(None);
    let reads = harness.produtos_router(Duration::from_secs(60));
    let failing = invalidate_on_write(
        Router::new().route(
            "/api/produtos/import",
            axum::routing::post(|| async { StatusCode::UNPROCESSABLE_ENTITY }),
        ),
        harness.store.clone(),
        &["produtos"],
    );
    let app = reads.merge(failing);

    send(&app, Method::GET, "/api/produtos").await;
    send(&app, Method::POST, "/api/produtos/import").await;
    harness.tasks.drained().await;

    let (_, cached, _) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(cached.as_deref(), Some("HIT"));
    assert_eq!(harness.handler_calls(), 1);
}

#[tokio::test]
async fn every_request_counts_toward_access() {
    let harness = Harness::new(None);
    let app = harness.produtos_router(Duration::from_secs(60));

    for _ in 0..3 {
        send(&app, Method::GET, "/api/produtos?page=1").await;
    }
    harness.tasks.drained().await;

    let record = harness
        .configs
        .find("/api/produtos")
        .await
        .expect("lookup")
        .expect("access recorded");
    assert_eq!(record.access_count, 3);
    assert!(record.enabled);
    assert_eq!(record.ttl_ms, 60_000);
}

#[tokio::test]
async fn disabled_endpoints_bypass_the_cache() {
    let harness = Harness::new(None);
    harness
        .configs
        .upsert(EndpointConfigUpsert {
            endpoint: "/api/produtos".to_string(),
            enabled: Some(false),
            ..Default::default()
        })
        .await
        .expect("upsert");
    let app = harness.produtos_router(Duration::from_secs(60));

    for _ in 0..2 {
        let (status, x_cache, _) = send(&app, Method::GET, "/api/produtos").await;
        assert_eq!(status, StatusCode::OK);
        assert!(x_cache.is_none());
    }
    assert_eq!(harness.handler_calls(), 2);
    assert_eq!(harness.store.stats().total_requests, 0);
    assert!(harness.store.local().is_empty());
}

#[tokio::test]
async fn stored_ttl_overrides_the_coded_default() {
    let harness = Harness::new(None);
    harness
        .configs
        .upsert(EndpointConfigUpsert {
            endpoint: "/api/produtos".to_string(),
            ttl_ms: Some(0),
            ..Default::default()
        })
        .await
        .expect("upsert");
    let app = harness.produtos_router(Duration::from_secs(60));

    send(&app, Method::GET, "/api/produtos").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (_, x_cache, _) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(x_cache.as_deref(), Some("MISS"));
    assert_eq!(harness.handler_calls(), 2);
}

#[tokio::test]
async fn distributed_outage_degrades_to_local_tier() {
    let tier = Arc::new(MemoryTier::new());
    let harness = Harness::new(Some(tier.clone()));
    let app = harness.produtos_router(Duration::from_secs(60));

    tier.set_available(false);
    let (status, first, _) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first.as_deref(), Some("MISS"));
    harness.tasks.drained().await;

    let (status, second, _) = send(&app, Method::GET, "/api/produtos").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second.as_deref(), Some("HIT"));
    assert_eq!(harness.handler_calls(), 1);
    assert!(tier.is_empty());
}

#[tokio::test]
async fn distributed_tier_serves_entries_written_by_other_instances() {
    let tier = Arc::new(MemoryTier::new());
    let writer = Harness::new(Some(tier.clone()));
    let writer_app = writer.produtos_router(Duration::from_secs(60));
    send(&writer_app, Method::GET, "/api/produtos").await;
    writer.tasks.drained().await;
    assert!(tier.contains("balcao:produtos:/api/produtos"));

    let reader = Harness::new(Some(tier.clone()));
    let reader_app = reader.produtos_router(Duration::from_secs(60));
    let (_, x_cache, body) = send(&reader_app, Method::GET, "/api/produtos").await;
    assert_eq!(x_cache.as_deref(), Some("HIT"));
    assert_eq!(body, "{\"version\":1}");
    assert_eq!(reader.handler_calls(), 0);
    assert!(reader.store.local().is_empty());
}

#[tokio::test]
async fn warmup_replays_the_busiest_endpoint_only() {
    let harness = Harness::new(None);
    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));

    let (a, b) = (hits_a.clone(), hits_b.clone());
    let routes = Router::new()
        .route(
            "/a",
            get(move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    "a"
                }
            }),
        )
        .route(
            "/b",
            get(move || {
                let b = b.clone();
                async move {
                    b.fetch_add(1, Ordering::SeqCst);
                    "b"
                }
            }),
        );
    let app = cacheable(routes, &harness.layer, Duration::from_secs(60));

    for (endpoint, count) in [("/a", 50), ("/b", 10)] {
        for _ in 0..count {
            harness
                .configs
                .increment_access(endpoint, 60_000)
                .await
                .expect("increment");
        }
    }

    let job = WarmupJob::new(app.clone(), harness.configs.clone(), harness.events.clone());
    let report = job.run(1).await.expect("warmup");

    assert_eq!(report.warmed_endpoints, vec!["/a".to_string()]);
    assert!(report.failed_endpoints.is_empty());
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 0);

    let (_, x_cache, _) = send(&app, Method::GET, "/a").await;
    assert_eq!(x_cache.as_deref(), Some("HIT"));
}
