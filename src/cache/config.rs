//! Cache configuration.
//!
//! Controls tier behaviour, policy resolution, and compression. Built from
//! the `[cache]` and `[distributed]` settings sections.

use std::time::Duration;

use serde::Deserialize;

use super::events::DEFAULT_EVENT_BUFFER;
use super::namespace::DEFAULT_API_PREFIX;

// Default values for cache configuration
const DEFAULT_TTL_MS: u64 = 300_000;
const DEFAULT_CAPTURE_BODY_LIMIT: usize = 8 * 1024 * 1024;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_COMPRESSION_MIN_BYTES: usize = 1024;
pub const DEFAULT_KEY_PREFIX: &str = "balcao:";

/// Resolved cache engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when an endpoint has no stored policy.
    pub default_ttl_ms: u64,
    /// Path prefix stripped before namespace routing.
    pub api_prefix: String,
    /// Largest response body captured for caching.
    pub capture_body_limit: usize,
    /// Local expiry sweep period (ms); 0 disables the sweeper.
    pub sweep_interval_ms: u64,
    /// How long resolved endpoint policies are memoised (ms); 0 disables.
    pub policy_cache_ttl_ms: u64,
    /// Smallest body gzipped by the cacheable layer.
    pub compression_min_bytes: usize,
    /// Capacity of the recent-events buffer.
    pub event_buffer: usize,
    /// Let "clear all" issue `FLUSHDB` on the distributed tier.
    pub flush_distributed_on_clear: bool,
    /// Prefix for every key written to the distributed tier.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_TTL_MS,
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            capture_body_limit: DEFAULT_CAPTURE_BODY_LIMIT,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            policy_cache_ttl_ms: 0,
            compression_min_bytes: DEFAULT_COMPRESSION_MIN_BYTES,
            event_buffer: DEFAULT_EVENT_BUFFER,
            flush_distributed_on_clear: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn from_settings(
        cache: &crate::config::CacheSettings,
        distributed: &crate::config::DistributedSettings,
    ) -> Self {
        Self {
            default_ttl_ms: cache.default_ttl_ms,
            api_prefix: cache.api_prefix.clone(),
            capture_body_limit: cache.capture_body_limit,
            sweep_interval_ms: cache.sweep_interval_ms,
            policy_cache_ttl_ms: cache.policy_cache_ttl_ms,
            compression_min_bytes: cache.compression_min_bytes,
            event_buffer: cache.event_buffer,
            flush_distributed_on_clear: cache.flush_distributed_on_clear,
            key_prefix: distributed.key_prefix.clone(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// `None` when the sweeper is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    pub fn policy_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.policy_cache_ttl_ms)
    }
}
