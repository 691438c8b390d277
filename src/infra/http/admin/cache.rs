use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};

use super::AdminState;
use crate::cache::namespace::NAMESPACES;
use crate::cache::{CacheEvent, ClearScope, WarmupError, WarmupReport};
use crate::infra::http::error::ApiError;

const SOURCE: &str = "infra::http::admin::cache";
const DEFAULT_WARMUP_LIMIT: usize = 10;
const MAX_WARMUP_LIMIT: usize = 100;
const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Debug, Serialize)]
pub(super) struct ClearResponse {
    scope: ClearScope,
}

pub(super) async fn clear_cache(State(state): State<AdminState>) -> Json<ClearResponse> {
    let scope = state.store.clear_all().await;
    state.policies.forget_all();
    Json(ClearResponse { scope })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct WarmupRequest {
    limit: Option<usize>,
}

pub(super) async fn warmup(
    State(state): State<AdminState>,
    request: Option<Json<WarmupRequest>>,
) -> Result<Json<WarmupReport>, ApiError> {
    let limit = request
        .and_then(|Json(request)| request.limit)
        .unwrap_or(DEFAULT_WARMUP_LIMIT);
    if limit == 0 || limit > MAX_WARMUP_LIMIT {
        return Err(ApiError::bad_request(
            SOURCE,
            "Invalid warmup limit",
            Some(format!("limit must be between 1 and {MAX_WARMUP_LIMIT}")),
        ));
    }

    match state.warmup.run(limit).await {
        Ok(report) => Ok(Json(report)),
        Err(WarmupError::Configs(err)) => Err(ApiError::from_repo(SOURCE, err)),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct InvalidateRequest {
    pattern: String,
}

#[derive(Debug, Serialize)]
pub(super) struct InvalidateResponse {
    pattern: String,
    matched: usize,
}

pub(super) async fn invalidate_pattern(
    State(state): State<AdminState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let matched = state
        .store
        .invalidate_pattern(&request.pattern)
        .await
        .map_err(|err| ApiError::from_cache(SOURCE, err))?;
    Ok(Json(InvalidateResponse {
        pattern: request.pattern,
        matched,
    }))
}

#[derive(Debug, Serialize)]
pub(super) struct NamespaceClearResponse {
    namespace: String,
    removed: usize,
}

pub(super) async fn clear_namespace(
    State(state): State<AdminState>,
    Path(namespace): Path<String>,
) -> Result<Json<NamespaceClearResponse>, ApiError> {
    if !NAMESPACES.contains(&namespace.as_str()) {
        return Err(ApiError::not_found(SOURCE, "Unknown namespace"));
    }

    let removed = state.store.clear_namespace(&namespace).await;
    Ok(Json(NamespaceClearResponse { namespace, removed }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct EventsQuery {
    limit: Option<usize>,
}

pub(super) async fn recent_events(
    State(state): State<AdminState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<CacheEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(state.events.recent(limit))
}
