mod cache;
mod configs;
mod health;
mod state;

pub use state::AdminState;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use super::middleware::{log_responses, set_request_context};

/// Router for the administrative listener. Bind it to a separate socket from
/// the public router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/cache/clear", post(cache::clear_cache))
        .route(
            "/admin/cache/configs",
            get(configs::list_configs)
                .put(configs::upsert_config)
                .delete(configs::delete_config),
        )
        .route("/admin/cache/warmup", post(cache::warmup))
        .route("/admin/cache/invalidate", post(cache::invalidate_pattern))
        .route(
            "/admin/cache/namespaces/{namespace}",
            delete(cache::clear_namespace),
        )
        .route("/admin/cache/events", get(cache::recent_events))
        .route("/admin/health", get(health::admin_health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}
