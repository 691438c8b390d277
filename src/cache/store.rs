//! Two-tier cache store.
//!
//! The local tier is authoritative for this process and always available.
//! The distributed tier is consulted first when reachable, but any failure
//! there is logged and treated as a miss or a no-op.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::CacheError;
use super::background::BackgroundTasks;
use super::config::CacheConfig;
use super::distributed::{DistributedTier, TierError, parse_info};
use super::events::{ClearScope, EventKind, EventSink};
use super::local::{LocalLookup, LocalTier};
use super::namespace::{NamespaceRouter, composite_key};
use super::pattern::{KeyPattern, escape_glob};
use super::payload::CachedPayload;
use super::stats::{CacheStatistics, CacheStatsReport};
use super::writer::DistributedWriter;

const SOURCE: &str = "cache::store";

const METRIC_HIT_TOTAL: &str = "balcao_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "balcao_cache_miss_total";
const METRIC_DISTRIBUTED_ERROR_TOTAL: &str = "balcao_cache_distributed_error_total";
const METRIC_INVALIDATED_TOTAL: &str = "balcao_cache_invalidated_total";

/// `INFO` fields surfaced by the distributed health report.
const INFO_FIELDS: &[&str] = &[
    "redis_version",
    "uptime_in_seconds",
    "connected_clients",
    "used_memory_human",
    "keyspace_hits",
    "keyspace_misses",
];

/// Reachability and server details of the distributed tier.
#[derive(Debug, Clone, Serialize)]
pub struct DistributedHealth {
    pub configured: bool,
    pub available: bool,
    pub dbsize: Option<u64>,
    pub info: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct CacheStore {
    local: LocalTier,
    distributed: Option<Arc<dyn DistributedTier>>,
    writer: Option<DistributedWriter>,
    key_prefix: String,
    flush_on_clear: bool,
    router: NamespaceRouter,
    stats: CacheStatistics,
    events: Arc<dyn EventSink>,
    tasks: BackgroundTasks,
}

impl CacheStore {
    pub fn new(config: &CacheConfig, events: Arc<dyn EventSink>, tasks: BackgroundTasks) -> Self {
        Self {
            local: LocalTier::new(),
            distributed: None,
            writer: None,
            key_prefix: config.key_prefix.clone(),
            flush_on_clear: config.flush_distributed_on_clear,
            router: NamespaceRouter::new(config.api_prefix.clone()),
            stats: CacheStatistics::new(),
            events,
            tasks,
        }
    }

    /// Attach a distributed tier and start its ordered writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_distributed(mut self, tier: Arc<dyn DistributedTier>) -> Self {
        self.writer = Some(DistributedWriter::spawn(tier.clone()));
        self.distributed = Some(tier);
        self
    }

    pub fn router(&self) -> &NamespaceRouter {
        &self.router
    }

    pub fn statistics(&self) -> &CacheStatistics {
        &self.stats
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn distributed_configured(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn distributed_available(&self) -> bool {
        self.reachable_tier().is_some()
    }

    /// Look up `key`, distributed tier first.
    ///
    /// A distributed hit is returned as-is and not copied into the local tier.
    pub async fn get(&self, key: &str, namespace: Option<&str>) -> Option<Bytes> {
        let composite = composite_key(key, namespace);
        match self.lookup(&composite).await {
            Some((value, tier)) => {
                self.record_hit(&composite, tier, value.len());
                Some(value)
            }
            None => {
                self.record_miss(&composite);
                None
            }
        }
    }

    /// Look up a captured response.
    ///
    /// Hits count the decoded body size as bytes served. An entry that does
    /// not decode is removed from both tiers and counted as a miss.
    pub async fn get_payload(&self, key: &str, namespace: Option<&str>) -> Option<CachedPayload> {
        let composite = composite_key(key, namespace);
        let (raw, tier) = match self.lookup(&composite).await {
            Some(found) => found,
            None => {
                self.record_miss(&composite);
                return None;
            }
        };

        match CachedPayload::decode(&raw) {
            Some(payload) => {
                self.record_hit(&composite, tier, payload.body.len());
                Some(payload)
            }
            None => {
                warn!(target = SOURCE, key = %composite, tier, "discarding undecodable cache entry");
                self.record_miss(&composite);
                self.invalidate(key, namespace).await;
                None
            }
        }
    }

    /// Store `value` in both tiers.
    ///
    /// The local write happens before returning. The distributed write is
    /// queued behind earlier writes with the TTL floored to whole seconds; a
    /// TTL under one second is kept local only.
    pub fn set(&self, key: &str, value: Bytes, ttl: Duration, namespace: Option<&str>) {
        let composite = composite_key(key, namespace);

        if let Some(writer) = self.writer.as_ref().filter(|_| self.distributed_available()) {
            let ttl_secs = ttl.as_secs();
            if ttl_secs == 0 {
                debug!(
                    target = SOURCE,
                    key = %composite,
                    ttl_ms = ttl.as_millis() as u64,
                    "ttl below one second, skipping distributed write"
                );
            } else {
                writer.set(
                    self.remote_key(&composite),
                    value.clone(),
                    ttl_secs,
                    self.tasks.hold(),
                );
            }
        }

        self.local.insert(composite, value, ttl);
    }

    /// Remove one exact key from both tiers. True when anything was removed.
    pub async fn invalidate(&self, key: &str, namespace: Option<&str>) -> bool {
        let composite = composite_key(key, namespace);
        let removed_local = self.local.remove(&composite);
        self.settle_writes().await;

        let mut removed_remote = 0;
        if let Some(tier) = self.reachable_tier() {
            match tier.delete(&[self.remote_key(&composite)]).await {
                Ok(count) => removed_remote = count,
                Err(err) => report_tier_error("delete", &err),
            }
        }

        removed_local || removed_remote > 0
    }

    /// Remove every key containing `pattern` from both tiers.
    ///
    /// Returns the number of distinct keys removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = KeyPattern::parse(pattern)?;

        let mut removed: HashSet<String> = self
            .local
            .remove_matching(|key| pattern.matches(key))
            .into_iter()
            .collect();
        self.settle_writes().await;
        removed.extend(self.remove_remote(&pattern.to_glob(&self.key_prefix)).await);

        let matched = removed.len();
        counter!(METRIC_INVALIDATED_TOTAL, "reason" => "pattern").increment(matched as u64);
        info!(
            target = SOURCE,
            pattern = pattern.as_str(),
            matched,
            "pattern invalidated"
        );
        self.events.publish(EventKind::PatternInvalidated {
            pattern: pattern.as_str().to_string(),
            matched,
        });
        Ok(matched)
    }

    /// Remove every key stored under `namespace` from both tiers.
    pub async fn clear_namespace(&self, namespace: &str) -> usize {
        let local_prefix = format!("{namespace}:");

        let mut removed: HashSet<String> = self
            .local
            .remove_matching(|key| key.starts_with(&local_prefix))
            .into_iter()
            .collect();
        self.settle_writes().await;
        let glob = format!("{}*", escape_glob(&self.remote_key(&local_prefix)));
        removed.extend(self.remove_remote(&glob).await);

        let count = removed.len();
        counter!(METRIC_INVALIDATED_TOTAL, "reason" => "namespace").increment(count as u64);
        info!(target = SOURCE, namespace, removed = count, "namespace cleared");
        self.events.publish(EventKind::NamespaceCleared {
            namespace: namespace.to_string(),
            removed: count,
        });
        count
    }

    /// Reset the local tier and every statistics counter.
    ///
    /// The distributed tier is left untouched.
    pub fn clear(&self) {
        self.local.clear();
        self.stats.reset();
    }

    /// Administrative "clear all".
    ///
    /// Clears the local tier, then removes every distributed key under the
    /// cache prefix. Flushes the whole distributed database instead when
    /// `flush_distributed_on_clear` is set.
    pub async fn clear_all(&self) -> ClearScope {
        self.clear();
        self.settle_writes().await;

        let scope = match self.reachable_tier() {
            None => ClearScope::Local,
            Some(tier) if self.flush_on_clear => {
                warn!(
                    target = SOURCE,
                    "flushing entire distributed database; keys owned by other applications are removed too"
                );
                match tier.flush_db().await {
                    Ok(()) => ClearScope::FlushedDatabase,
                    Err(err) => {
                        report_tier_error("flush_db", &err);
                        ClearScope::Local
                    }
                }
            }
            Some(_) => {
                let glob = format!("{}*", escape_glob(&self.key_prefix));
                self.remove_remote(&glob).await;
                ClearScope::Prefixed
            }
        };

        info!(target = SOURCE, scope = ?scope, "cache cleared");
        self.events.publish(EventKind::CacheCleared { scope });
        scope
    }

    pub fn stats(&self) -> CacheStatsReport {
        CacheStatsReport::new(
            self.stats.snapshot(),
            self.local.len(),
            self.distributed_available(),
        )
    }

    pub async fn distributed_health(&self) -> DistributedHealth {
        let mut health = DistributedHealth {
            configured: self.distributed.is_some(),
            available: false,
            dbsize: None,
            info: BTreeMap::new(),
            error: None,
        };
        let Some(tier) = self.distributed.as_ref() else {
            return health;
        };
        health.available = tier.is_available();
        if !health.available {
            return health;
        }

        match tier.db_size().await {
            Ok(size) => health.dbsize = Some(size),
            Err(err) => health.error = Some(err.to_string()),
        }
        match tier.info().await {
            Ok(raw) => {
                health.info = parse_info(&raw)
                    .into_iter()
                    .filter(|(field, _)| INFO_FIELDS.contains(&field.as_str()))
                    .collect();
            }
            Err(err) => health.error = Some(err.to_string()),
        }
        health
    }

    pub fn sweep_expired(&self) -> usize {
        let removed = self.local.sweep_expired();
        if removed > 0 {
            debug!(target = SOURCE, removed, "swept expired local entries");
        }
        removed
    }

    /// Periodically sweep expired local entries until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }

    async fn lookup(&self, composite: &str) -> Option<(Bytes, &'static str)> {
        if let Some(tier) = self.reachable_tier() {
            match tier.get(&self.remote_key(composite)).await {
                Ok(Some(value)) => return Some((value, "distributed")),
                Ok(None) => {}
                Err(err) => report_tier_error("get", &err),
            }
        }

        match self.local.get(composite) {
            LocalLookup::Hit(value) => Some((value, "local")),
            LocalLookup::Expired | LocalLookup::Absent => None,
        }
    }

    fn record_hit(&self, composite: &str, tier: &'static str, bytes: usize) {
        self.stats.record_hit(bytes);
        counter!(METRIC_HIT_TOTAL, "tier" => tier).increment(1);
        debug!(target = SOURCE, key = %composite, tier, "cache hit");
    }

    fn record_miss(&self, composite: &str) {
        self.stats.record_miss();
        counter!(METRIC_MISS_TOTAL).increment(1);
        debug!(target = SOURCE, key = %composite, "cache miss");
    }

    /// Wait for queued distributed writes to land before removing keys.
    async fn settle_writes(&self) {
        if let Some(writer) = &self.writer {
            writer.settled().await;
        }
    }

    fn reachable_tier(&self) -> Option<&Arc<dyn DistributedTier>> {
        self.distributed.as_ref().filter(|tier| tier.is_available())
    }

    fn remote_key(&self, composite: &str) -> String {
        format!("{}{}", self.key_prefix, composite)
    }

    /// Delete remote keys matching `glob`; returns them without the prefix.
    async fn remove_remote(&self, glob: &str) -> Vec<String> {
        let Some(tier) = self.reachable_tier() else {
            return Vec::new();
        };

        let keys = match tier.keys(glob).await {
            Ok(keys) => keys,
            Err(err) => {
                report_tier_error("keys", &err);
                return Vec::new();
            }
        };
        if keys.is_empty() {
            return keys;
        }

        if let Err(err) = tier.delete(&keys).await {
            report_tier_error("delete", &err);
            return Vec::new();
        }

        keys.into_iter()
            .map(|key| match key.strip_prefix(self.key_prefix.as_str()) {
                Some(stripped) => stripped.to_string(),
                None => key,
            })
            .collect()
    }
}

pub(super) fn report_tier_error(op: &'static str, err: &TierError) {
    counter!(METRIC_DISTRIBUTED_ERROR_TOTAL, "op" => op).increment(1);
    warn!(target = SOURCE, op, error = %err, "distributed tier operation failed");
}
