use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use super::AdminState;
use crate::infra::http::error::ApiError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminHealth {
    config_store: &'static str,
    distributed_configured: bool,
    distributed_available: bool,
    background_tasks: usize,
}

/// 200 with component status when the config store answers, 503 otherwise.
/// The distributed tier never fails this check; the cache runs without it.
pub(super) async fn admin_health(State(state): State<AdminState>) -> Response {
    if let Err(err) = state.configs().health_check().await {
        return ApiError::unavailable("infra::http::admin::health", err.to_string())
            .into_response();
    }

    let body = AdminHealth {
        config_store: "ok",
        distributed_configured: state.store.distributed_configured(),
        distributed_available: state.store.distributed_available(),
        background_tasks: state.store.tasks().in_flight(),
    };
    (StatusCode::OK, Json(body)).into_response()
}
