use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    routing::get,
};
use balcao::application::repos::EndpointConfigRepo;
use balcao::cache::{
    BackgroundTasks, CacheConfig, CacheLayerState, CacheStore, EventKind, EventQueue, EventSink,
    PolicyResolver, WarmupJob, cacheable,
};
use balcao::infra::memory::MemoryConfigStore;
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;
use tower::ServiceExt;

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Event buffer overflow
    let queue = EventQueue::new_with_limit(1);
    queue.publish(EventKind::ConfigUpdated {
        endpoint: "/api/vendas".to_string(),
    });
    queue.publish(EventKind::ConfigDeleted {
        endpoint: "/api/vendas".to_string(),
    });

    // Hit and miss through the middleware path, then a pattern invalidation
    let config = CacheConfig::default();
    let events = Arc::new(EventQueue::new());
    let tasks = BackgroundTasks::new();
    let store = Arc::new(CacheStore::new(&config, events.clone(), tasks.clone()));
    let configs = Arc::new(MemoryConfigStore::new());
    let policies = Arc::new(PolicyResolver::new(configs.clone(), Duration::ZERO));
    let layer = CacheLayerState::new(store.clone(), policies, &config);

    let app = cacheable(
        Router::new().route("/api/vendas", get(|| async { "ok" })),
        &layer,
        Duration::from_secs(60),
    );

    for _ in 0..2 {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/vendas")
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }
    tasks.drained().await;

    store
        .invalidate_pattern("vendas")
        .await
        .expect("valid pattern");

    // Warmup latency
    assert_eq!(
        configs
            .top_enabled_by_access(1)
            .await
            .expect("top endpoints")
            .len(),
        1
    );
    let job = WarmupJob::new(app.clone(), configs.clone(), events.clone());
    job.run(1).await.expect("warmup");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "balcao_cache_hit_total",
        "balcao_cache_miss_total",
        "balcao_cache_invalidated_total",
        "balcao_cache_event_dropped_total",
        "balcao_cache_warm_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
