//! Per-endpoint cache policy resolution.
//!
//! The store lookup happens on every cacheable request unless the policy memo
//! is enabled. Store failures never reach the request: the caller's default
//! policy is used instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::repos::{
    DEFAULT_COMPRESSION_LEVEL, EndpointConfigRecord, EndpointConfigRepo,
};

use super::background::BackgroundTasks;
use super::lock::{rw_read, rw_write};

const COMPONENT: &str = "cache::policy";
const METRIC_POLICY_LOOKUP_ERROR_TOTAL: &str = "balcao_cache_policy_lookup_error_total";

/// Effective cache behaviour for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPolicy {
    pub ttl: Duration,
    pub enabled: bool,
    pub compression_enabled: bool,
    pub compression_level: u8,
}

impl EndpointPolicy {
    /// Policy for an endpoint with no stored configuration.
    pub fn fallback(default_ttl: Duration) -> Self {
        Self {
            ttl: default_ttl,
            enabled: true,
            compression_enabled: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn from_record(record: &EndpointConfigRecord) -> Self {
        Self {
            ttl: Duration::from_millis(record.ttl_ms),
            enabled: record.enabled,
            compression_enabled: record.compression_enabled,
            compression_level: record.compression_level,
        }
    }
}

type Memo = HashMap<String, (Option<EndpointConfigRecord>, Instant)>;

pub struct PolicyResolver {
    repo: Arc<dyn EndpointConfigRepo>,
    memo_ttl: Duration,
    memo: RwLock<Memo>,
}

impl PolicyResolver {
    /// `memo_ttl` of zero disables memoisation.
    pub fn new(repo: Arc<dyn EndpointConfigRepo>, memo_ttl: Duration) -> Self {
        Self {
            repo,
            memo_ttl,
            memo: RwLock::new(HashMap::new()),
        }
    }

    pub fn repo(&self) -> &Arc<dyn EndpointConfigRepo> {
        &self.repo
    }

    pub async fn resolve(&self, endpoint: &str, default_ttl: Duration) -> EndpointPolicy {
        let record = match self.memoised(endpoint) {
            Some(record) => record,
            None => match self.repo.find(endpoint).await {
                Ok(record) => {
                    self.remember(endpoint, record.clone());
                    record
                }
                Err(err) => {
                    counter!(METRIC_POLICY_LOOKUP_ERROR_TOTAL).increment(1);
                    warn!(
                        endpoint,
                        error = %err,
                        "endpoint policy lookup failed, using default policy"
                    );
                    None
                }
            },
        };

        record
            .as_ref()
            .map(EndpointPolicy::from_record)
            .unwrap_or_else(|| EndpointPolicy::fallback(default_ttl))
    }

    /// Bump the endpoint's access counter without waiting for the store.
    pub fn record_access(&self, tasks: &BackgroundTasks, endpoint: &str, default_ttl: Duration) {
        let repo = self.repo.clone();
        let endpoint = endpoint.to_string();
        let default_ttl_ms = u64::try_from(default_ttl.as_millis()).unwrap_or(u64::MAX);
        tasks.spawn("record_access", async move {
            if let Err(err) = repo.increment_access(&endpoint, default_ttl_ms).await {
                debug!(endpoint = %endpoint, error = %err, "access count update failed");
            }
        });
    }

    /// Drop a memoised record so the next request re-reads the store.
    pub fn forget(&self, endpoint: &str) {
        rw_write(&self.memo, COMPONENT, "forget").remove(endpoint);
    }

    pub fn forget_all(&self) {
        rw_write(&self.memo, COMPONENT, "forget_all").clear();
    }

    fn memoised(&self, endpoint: &str) -> Option<Option<EndpointConfigRecord>> {
        if self.memo_ttl.is_zero() {
            return None;
        }
        let memo = rw_read(&self.memo, COMPONENT, "memoised");
        memo.get(endpoint)
            .filter(|(_, stored_at)| stored_at.elapsed() <= self.memo_ttl)
            .map(|(record, _)| record.clone())
    }

    fn remember(&self, endpoint: &str, record: Option<EndpointConfigRecord>) {
        if self.memo_ttl.is_zero() {
            return;
        }
        rw_write(&self.memo, COMPONENT, "remember")
            .insert(endpoint.to_string(), (record, Instant::now()));
    }
}
