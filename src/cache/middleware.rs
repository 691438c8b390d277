//! Response cache middleware.
//!
//! [`cacheable`] serves GET requests from the [`CacheStore`] and captures
//! `200 OK` responses on a miss. [`invalidate_on_write`] busts patterns after
//! successful mutating requests, without delaying the response.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes, HttpBody},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode,
        header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use flate2::{Compression, write::GzEncoder};
use tracing::{debug, error, instrument, warn};

use super::{
    CacheConfig, CacheStore, KeyPattern,
    payload::CachedPayload,
    policy::{EndpointPolicy, PolicyResolver},
};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the cacheable layer.
#[derive(Clone)]
pub struct CacheLayerState {
    pub store: Arc<CacheStore>,
    pub policies: Arc<PolicyResolver>,
    pub default_ttl: Duration,
    pub capture_body_limit: usize,
    pub compression_min_bytes: usize,
}

impl CacheLayerState {
    pub fn new(store: Arc<CacheStore>, policies: Arc<PolicyResolver>, config: &CacheConfig) -> Self {
        Self {
            store,
            policies,
            default_ttl: config.default_ttl(),
            capture_body_limit: config.capture_body_limit,
            compression_min_bytes: config.compression_min_bytes,
        }
    }

    pub fn with_default_ttl(&self, default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            ..self.clone()
        }
    }
}

/// Shared state for the write-invalidation layer.
#[derive(Clone)]
pub struct InvalidationState {
    pub store: Arc<CacheStore>,
    pub patterns: Arc<[String]>,
}

/// Serve `routes` through the response cache, using `default_ttl` for
/// endpoints without a stored policy.
pub fn cacheable<S>(routes: Router<S>, state: &CacheLayerState, default_ttl: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    routes.layer(middleware::from_fn_with_state(
        state.with_default_ttl(default_ttl),
        cache_response,
    ))
}

/// Invalidate `patterns` after every successful mutating request to `routes`.
///
/// Patterns that fail validation are logged and skipped.
pub fn invalidate_on_write<S>(
    routes: Router<S>,
    store: Arc<CacheStore>,
    patterns: &[&str],
) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let patterns: Vec<String> = patterns
        .iter()
        .filter(|raw| match KeyPattern::parse(raw) {
            Ok(_) => true,
            Err(err) => {
                error!(pattern = **raw, error = %err, "dropping invalid invalidation pattern");
                false
            }
        })
        .map(|raw| raw.to_string())
        .collect();

    routes.layer(middleware::from_fn_with_state(
        InvalidationState {
            store,
            patterns: patterns.into(),
        },
        invalidate_writes,
    ))
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
async fn cache_response(
    State(cache): State<CacheLayerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    let key = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    cache
        .policies
        .record_access(cache.store.tasks(), &path, cache.default_ttl);
    let policy = cache.policies.resolve(&path, cache.default_ttl).await;
    if !policy.enabled {
        debug!(cache = "response", outcome = "bypass", "caching disabled for endpoint");
        return next.run(request).await;
    }

    let stats = cache.store.statistics();
    stats.record_request();
    let gzip = accepts_gzip(request.headers());
    let namespace = cache.store.router().route(&path);

    if let Some(payload) = cache.store.get_payload(&key, namespace).await {
        debug!(cache = "response", outcome = "hit", "serving cached response");
        return cached_response(&cache, payload, &policy, gzip);
    }

    debug!(cache = "response", outcome = "miss", "cache miss, executing handler");
    let response = next.run(request).await;

    if response.headers().contains_key(CONTENT_ENCODING) {
        // Already encoded upstream; pass through without capturing.
        stats.record_compressed();
        return response;
    }
    if response.status() != StatusCode::OK {
        return response;
    }
    if !capturable(response.body(), cache.capture_body_limit) {
        debug!(cache = "response", outcome = "uncaptured", "body size unknown or over limit");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, cache.capture_body_limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "failed to capture response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let payload = CachedPayload::new(content_type, bytes.clone());
    cache.store.set(&key, payload.encode(), policy.ttl, namespace);

    parts.headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
    let body = finish_body(&cache, &mut parts.headers, bytes, &policy, gzip);
    Response::from_parts(parts, Body::from(body))
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn invalidate_writes(
    State(state): State<InvalidationState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mutating = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    let response = next.run(request).await;

    if mutating && response.status().is_success() && !state.patterns.is_empty() {
        let store = state.store.clone();
        let patterns = state.patterns.clone();
        state.store.tasks().spawn("write_invalidation", async move {
            for pattern in patterns.iter() {
                if let Err(err) = store.invalidate_pattern(pattern).await {
                    warn!(pattern = %pattern, error = %err, "write invalidation failed");
                }
            }
        });
    }

    response
}

fn cached_response(
    cache: &CacheLayerState,
    payload: CachedPayload,
    policy: &EndpointPolicy,
    gzip: bool,
) -> Response {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    if let Some(content_type) = payload
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        headers.insert(CONTENT_TYPE, content_type);
    }
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));

    let body = finish_body(cache, headers, payload.body, policy, gzip);
    *response.body_mut() = Body::from(body);
    response
}

/// Gzip `body` when the client, endpoint, and size threshold all allow it.
fn finish_body(
    cache: &CacheLayerState,
    headers: &mut HeaderMap,
    body: Bytes,
    policy: &EndpointPolicy,
    gzip: bool,
) -> Bytes {
    if !gzip || !policy.compression_enabled || body.len() < cache.compression_min_bytes {
        return body;
    }

    match gzip_bytes(&body, policy.compression_level) {
        Ok(compressed) => {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            headers.append(VARY, HeaderValue::from_static("accept-encoding"));
            headers.remove(CONTENT_LENGTH);
            cache.store.statistics().record_compressed();
            compressed
        }
        Err(err) => {
            warn!(error = %err, "gzip failed, sending uncompressed body");
            body
        }
    }
}

fn gzip_bytes(body: &[u8], level: u8) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::new(level.into()));
    encoder.write_all(body)?;
    encoder.finish().map(Bytes::from)
}

/// Only bodies with a known upper bound within `limit` are buffered; anything
/// else streams through untouched.
fn capturable(body: &Body, limit: usize) -> bool {
    body.size_hint()
        .upper()
        .is_some_and(|upper| upper <= limit as u64)
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| {
            let mut params = token.split(';').map(str::trim);
            let coding = params.next().unwrap_or_default();
            let refused = params.any(|param| {
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q == 0.0)
            });
            (coding.eq_ignore_ascii_case("gzip") || coding == "*") && !refused
        })
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::routing::get;
    use flate2::read::GzDecoder;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::{BackgroundTasks, NullSink};
    use crate::infra::memory::MemoryConfigStore;

    fn layer_state() -> CacheLayerState {
        let config = CacheConfig::default();
        let store = Arc::new(CacheStore::new(
            &config,
            Arc::new(NullSink),
            BackgroundTasks::new(),
        ));
        let policies = Arc::new(PolicyResolver::new(
            Arc::new(MemoryConfigStore::new()),
            Duration::ZERO,
        ));
        CacheLayerState::new(store, policies, &config)
    }

    fn counting_router(
        state: &CacheLayerState,
        calls: Arc<AtomicUsize>,
        body: impl Into<String>,
    ) -> Router {
        let body: String = body.into();
        let routes = Router::new().route(
            "/api/produtos",
            get(move || {
                let calls = calls.clone();
                let body = body.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(CONTENT_TYPE, "application/json")], body)
                }
            }),
        );
        cacheable(routes, state, Duration::from_secs(60))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("valid request")
    }

    #[test]
    fn accept_encoding_parsing() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("br, gzip;q=0.8"));
        assert!(accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip;q=0"));
        assert!(!accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        assert!(!accepts_gzip(&headers));
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let state = layer_state();
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_router(&state, calls.clone(), "[1,2,3]");

        let first = app
            .clone()
            .oneshot(get_request("/api/produtos"))
            .await
            .expect("response");
        assert_eq!(first.headers().get(X_CACHE).map(|v| v.as_bytes()), Some(&b"MISS"[..]));

        let second = app.oneshot(get_request("/api/produtos")).await.expect("response");
        assert_eq!(second.headers().get(X_CACHE).map(|v| v.as_bytes()), Some(&b"HIT"[..]));
        assert_eq!(
            second.headers().get(CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"application/json"[..])
        );
        let body = axum::body::to_bytes(second.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"[1,2,3]");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = state.store.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn query_strings_are_distinct_keys() {
        let state = layer_state();
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_router(&state, calls.clone(), "[]");

        for uri in ["/api/produtos?a=1&b=2", "/api/produtos?b=2&a=1"] {
            app.clone().oneshot(get_request(uri)).await.expect("response");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(state.store.local().contains("produtos:/api/produtos?a=1&b=2"));
    }

    #[tokio::test]
    async fn non_ok_responses_are_not_cached() {
        let state = layer_state();
        let routes = Router::new().route(
            "/api/vendas",
            get(|| async { (StatusCode::NOT_FOUND, "missing") }),
        );
        let app = cacheable(routes, &state, Duration::from_secs(60));

        app.clone().oneshot(get_request("/api/vendas")).await.expect("response");
        assert!(state.store.local().is_empty());
    }

    #[tokio::test]
    async fn large_bodies_are_gzipped_for_willing_clients() {
        let state = layer_state();
        let payload = "x".repeat(4096);
        let app = counting_router(&state, Arc::new(AtomicUsize::new(0)), payload.clone());

        let request = Request::builder()
            .uri("/api/produtos")
            .header(ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .expect("valid request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(
            response.headers().get(CONTENT_ENCODING).map(|v| v.as_bytes()),
            Some(&b"gzip"[..])
        );

        let compressed = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let mut decoded = String::new();
        GzDecoder::new(&compressed[..])
            .read_to_string(&mut decoded)
            .expect("valid gzip");
        assert_eq!(decoded, payload);

        // The cached copy stays uncompressed.
        let raw = state
            .store
            .get("/api/produtos", Some("produtos"))
            .await
            .expect("cached");
        let cached = CachedPayload::decode(&raw).expect("envelope");
        assert_eq!(cached.body.len(), 4096);
        assert_eq!(state.store.stats().compressed_responses, 1);
    }

    #[tokio::test]
    async fn small_bodies_are_not_compressed() {
        let state = layer_state();
        let app = counting_router(&state, Arc::new(AtomicUsize::new(0)), "tiny");

        let request = Request::builder()
            .uri("/api/produtos")
            .header(ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .expect("valid request");
        let response = app.oneshot(request).await.expect("response");
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(state.store.stats().compressed_responses, 0);
    }

    #[tokio::test]
    async fn pre_encoded_responses_count_as_compressed() {
        let state = layer_state();
        let routes = Router::new().route(
            "/api/vitrine",
            get(|| async { ([(CONTENT_ENCODING, "br")], "opaque") }),
        );
        let app = cacheable(routes, &state, Duration::from_secs(60));

        app.oneshot(get_request("/api/vitrine")).await.expect("response");
        let stats = state.store.stats();
        assert_eq!(stats.compressed_responses, 1);
        assert_eq!(stats.compression_rate, 100.0);
        assert!(state.store.local().is_empty());
    }

    #[tokio::test]
    async fn oversized_bodies_pass_through_uncached() {
        let state = CacheLayerState {
            capture_body_limit: 16,
            ..layer_state()
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_router(&state, calls.clone(), "x".repeat(64));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(get_request("/api/produtos"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(X_CACHE).is_none());
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body");
            assert_eq!(body.len(), 64);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(state.store.local().is_empty());
    }

    #[tokio::test]
    async fn bytes_served_count_the_response_body() {
        let state = layer_state();
        let app = counting_router(&state, Arc::new(AtomicUsize::new(0)), "0123456789");

        for _ in 0..2 {
            app.clone()
                .oneshot(get_request("/api/produtos"))
                .await
                .expect("response");
        }

        let stats = state.store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.bytes_served_from_cache, 10);
    }
}
