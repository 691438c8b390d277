use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use tracing::info;

use super::AdminState;
use crate::application::repos::{EndpointConfigRecord, EndpointConfigUpsert};
use crate::cache::{EventKind, EventSink};
use crate::infra::http::error::ApiError;

const SOURCE: &str = "infra::http::admin::configs";

#[derive(Debug, Deserialize)]
pub(super) struct EndpointQuery {
    endpoint: String,
}

pub(super) async fn list_configs(
    State(state): State<AdminState>,
) -> Result<Json<Vec<EndpointConfigRecord>>, ApiError> {
    let records = state
        .configs()
        .list_all()
        .await
        .map_err(|err| ApiError::from_repo(SOURCE, err))?;
    Ok(Json(records))
}

pub(super) async fn upsert_config(
    State(state): State<AdminState>,
    Json(payload): Json<EndpointConfigUpsert>,
) -> Result<Json<EndpointConfigRecord>, ApiError> {
    let record = state
        .configs()
        .upsert(payload)
        .await
        .map_err(|err| ApiError::from_repo(SOURCE, err))?;

    state.policies.forget(&record.endpoint);
    info!(
        target = SOURCE,
        endpoint = %record.endpoint,
        ttl_ms = record.ttl_ms,
        enabled = record.enabled,
        "endpoint cache config updated"
    );
    state.store.events().publish(EventKind::ConfigUpdated {
        endpoint: record.endpoint.clone(),
    });
    Ok(Json(record))
}

/// Drop the stored policy so the endpoint reverts to its coded default.
pub(super) async fn delete_config(
    State(state): State<AdminState>,
    Query(query): Query<EndpointQuery>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .configs()
        .delete(&query.endpoint)
        .await
        .map_err(|err| ApiError::from_repo(SOURCE, err))?;
    if !removed {
        return Err(ApiError::not_found(SOURCE, "Endpoint config not found"));
    }

    state.policies.forget(&query.endpoint);
    info!(target = SOURCE, endpoint = %query.endpoint, "endpoint cache config deleted");
    state.store.events().publish(EventKind::ConfigDeleted {
        endpoint: query.endpoint,
    });
    Ok(StatusCode::NO_CONTENT)
}
