//! Process-local cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters owned by a [`CacheStore`](super::CacheStore).
///
/// Counters are per process; nothing here is shared between instances.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    total_requests: AtomicU64,
    compressed_responses: AtomicU64,
    bytes_served_from_cache: AtomicU64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, bytes: usize) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served_from_cache
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compressed(&self) {
        self.compressed_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.total_requests.store(0, Ordering::Relaxed);
        self.compressed_responses.store(0, Ordering::Relaxed);
        self.bytes_served_from_cache.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            compressed_responses: self.compressed_responses.load(Ordering::Relaxed),
            bytes_served_from_cache: self.bytes_served_from_cache.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub compressed_responses: u64,
    pub bytes_served_from_cache: u64,
}

/// Aggregate statistics as served by the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsReport {
    pub local_entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups that hit, rounded to two decimals.
    pub hit_rate: f64,
    pub total_requests: u64,
    pub compressed_responses: u64,
    /// Percentage of requests answered compressed, rounded to two decimals.
    pub compression_rate: f64,
    pub bytes_served_from_cache: u64,
    pub requests_saved_by_cache: u64,
    pub distributed_available: bool,
}

impl CacheStatsReport {
    pub fn new(counters: CounterSnapshot, local_entries: usize, distributed_available: bool) -> Self {
        Self {
            local_entries,
            hits: counters.hits,
            misses: counters.misses,
            hit_rate: percentage(counters.hits, counters.hits + counters.misses),
            total_requests: counters.total_requests,
            compressed_responses: counters.compressed_responses,
            compression_rate: percentage(counters.compressed_responses, counters.total_requests),
            bytes_served_from_cache: counters.bytes_served_from_cache,
            requests_saved_by_cache: counters.hits,
            distributed_available,
        }
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let pct = part as f64 / whole as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}
