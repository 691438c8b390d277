//! Cache warmup.
//!
//! Replays synthetic GETs for the most-requested enabled endpoints through the
//! public router, so responses land in the cache through the normal
//! cacheable path.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request},
};
use metrics::histogram;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::{info, warn};

use crate::application::repos::{EndpointConfigRepo, RepoError};

use super::events::{EventKind, EventSink};

const METRIC_WARM_MS: &str = "balcao_cache_warm_ms";

#[derive(Debug, Error)]
pub enum WarmupError {
    #[error("failed to load endpoint configurations: {0}")]
    Configs(#[from] RepoError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupFailure {
    pub endpoint: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupReport {
    pub warmed_endpoints: Vec<String>,
    pub failed_endpoints: Vec<WarmupFailure>,
    pub warmed_count: usize,
    pub failed_count: usize,
}

pub struct WarmupJob {
    app: Router,
    configs: Arc<dyn EndpointConfigRepo>,
    events: Arc<dyn EventSink>,
}

impl WarmupJob {
    /// `app` must route through the cacheable layer for warmup to populate
    /// anything.
    pub fn new(app: Router, configs: Arc<dyn EndpointConfigRepo>, events: Arc<dyn EventSink>) -> Self {
        Self {
            app,
            configs,
            events,
        }
    }

    /// Warm the `limit` enabled endpoints with the highest access counts.
    ///
    /// Requests run one after another; each endpoint succeeds or fails on its
    /// own.
    pub async fn run(&self, limit: usize) -> Result<WarmupReport, WarmupError> {
        let started = Instant::now();
        let targets = self.configs.top_enabled_by_access(limit).await?;
        info!(
            target = "balcao::cache::warmup",
            endpoints = targets.len(),
            limit,
            "warming response cache"
        );

        let mut report = WarmupReport::default();
        for target in targets {
            match self.replay(&target.endpoint).await {
                Ok(()) => report.warmed_endpoints.push(target.endpoint),
                Err(reason) => {
                    warn!(
                        target = "balcao::cache::warmup",
                        endpoint = %target.endpoint,
                        reason = %reason,
                        "endpoint warmup failed"
                    );
                    report.failed_endpoints.push(WarmupFailure {
                        endpoint: target.endpoint,
                        reason,
                    });
                }
            }
        }
        report.warmed_count = report.warmed_endpoints.len();
        report.failed_count = report.failed_endpoints.len();

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_WARM_MS).record(elapsed_ms);
        info!(
            target = "balcao::cache::warmup",
            warmed = report.warmed_count,
            failed = report.failed_count,
            elapsed_ms,
            "cache warmup finished"
        );
        self.events.publish(EventKind::CacheWarmed {
            warmed: report.warmed_count,
            failed: report.failed_count,
        });

        Ok(report)
    }

    async fn replay(&self, endpoint: &str) -> Result<(), String> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(endpoint)
            .body(Body::empty())
            .map_err(|err| err.to_string())?;

        let response = match self.app.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::http::StatusCode;
    use axum::routing::get;
    use time::OffsetDateTime;

    use super::*;
    use crate::application::repos::EndpointConfigRecord;
    use crate::cache::EventQueue;
    use crate::infra::memory::MemoryConfigStore;

    fn record(endpoint: &str, access_count: u64, enabled: bool) -> EndpointConfigRecord {
        EndpointConfigRecord {
            access_count,
            enabled,
            ..EndpointConfigRecord::first_access(endpoint, 60_000, OffsetDateTime::UNIX_EPOCH)
        }
    }

    fn recording_app(seen: Arc<Mutex<Vec<String>>>) -> Router {
        let handler = move |uri: axum::http::Uri| {
            let seen = seen.clone();
            async move {
                let path = uri.path().to_string();
                let status = if path == "/broken" {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                };
                if let Ok(mut seen) = seen.lock() {
                    seen.push(path);
                }
                status
            }
        };
        Router::new()
            .route("/a", get(handler.clone()))
            .route("/b", get(handler.clone()))
            .route("/broken", get(handler))
    }

    #[tokio::test]
    async fn replays_only_the_top_endpoints() {
        let configs = Arc::new(MemoryConfigStore::with_records(vec![
            record("/a", 50, true),
            record("/b", 10, true),
        ]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(EventQueue::new());
        let job = WarmupJob::new(recording_app(seen.clone()), configs, events.clone());

        let report = job.run(1).await.expect("warmup runs");

        assert_eq!(report.warmed_endpoints, vec!["/a".to_string()]);
        assert_eq!(report.warmed_count, 1);
        assert_eq!(report.failed_count, 0);
        assert_eq!(*seen.lock().expect("lock"), vec!["/a".to_string()]);
        assert!(events.recent(1).iter().any(|event| event.kind
            == EventKind::CacheWarmed {
                warmed: 1,
                failed: 0
            }));
    }

    #[tokio::test]
    async fn failures_are_collected_per_endpoint() {
        let configs = Arc::new(MemoryConfigStore::with_records(vec![
            record("/broken", 30, true),
            record("/a", 20, true),
            record("not a uri", 10, true),
            record("/b", 90, false),
        ]));
        let job = WarmupJob::new(
            recording_app(Arc::new(Mutex::new(Vec::new()))),
            configs,
            Arc::new(EventQueue::new()),
        );

        let report = job.run(10).await.expect("warmup runs");

        assert_eq!(report.warmed_endpoints, vec!["/a".to_string()]);
        assert_eq!(report.failed_count, 2);
        assert_eq!(report.failed_endpoints[0].endpoint, "/broken");
        assert_eq!(report.failed_endpoints[0].reason, "HTTP 503 Service Unavailable");
        assert_eq!(report.failed_endpoints[1].endpoint, "not a uri");
    }

    #[tokio::test]
    async fn router_without_application_routes_reports_not_found() {
        let configs = Arc::new(MemoryConfigStore::with_records(vec![record(
            "/api/produtos",
            5,
            true,
        )]));
        let job = WarmupJob::new(Router::new(), configs, Arc::new(EventQueue::new()));

        let report = job.run(10).await.expect("warmup runs");

        assert!(report.warmed_endpoints.is_empty());
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.failed_endpoints[0].reason, "HTTP 404 Not Found");
    }
}
