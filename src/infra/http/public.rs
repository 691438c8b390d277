use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::application::repos::EndpointConfigRepo;
use crate::cache::{CacheStatsReport, CacheStore, DistributedHealth};

use super::error::ApiError;
use super::middleware::{log_responses, set_request_context};

const SOURCE: &str = "infra::http::public";

#[derive(Clone)]
pub struct PublicState {
    pub store: Arc<CacheStore>,
    pub configs: Arc<dyn EndpointConfigRepo>,
}

/// Mount the read-only cache endpoints next to the application's own routes.
///
/// `app` should already be wrapped with [`cacheable`](crate::cache::cacheable)
/// and [`invalidate_on_write`](crate::cache::invalidate_on_write) where
/// appropriate. The cache endpoints themselves are never cached.
pub fn build_public_router(state: PublicState, app: Router) -> Router {
    let cache_routes = Router::new()
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/distributed", get(distributed_health))
        .route("/health", get(health))
        .with_state(state);

    app.merge(cache_routes)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn cache_stats(State(state): State<PublicState>) -> Json<CacheStatsReport> {
    Json(state.store.stats())
}

async fn distributed_health(State(state): State<PublicState>) -> Json<DistributedHealth> {
    Json(state.store.distributed_health().await)
}

async fn health(State(state): State<PublicState>) -> Response {
    match state.configs.health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::unavailable(SOURCE, err.to_string()).into_response(),
    }
}
