//! Balcao response cache.
//!
//! Two tiers sit behind a single [`CacheStore`]:
//!
//! - **Local**: in-process map with per-entry TTL, always available
//! - **Distributed**: optional shared backend with native expiry; failures
//!   degrade to the local tier
//!
//! [`cacheable`] and [`invalidate_on_write`] wire the store into axum routers.
//! Per-endpoint policies come from an
//! [`EndpointConfigRepo`](crate::application::repos::EndpointConfigRepo).
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! default_ttl_ms = 300000
//! api_prefix = "/api"
//! sweep_interval_ms = 60000
//! # ... see config.rs for all options
//! ```

use thiserror::Error;

mod background;
mod config;
pub mod distributed;
mod events;
mod local;
mod lock;
mod middleware;
pub mod namespace;
mod pattern;
mod payload;
mod policy;
mod stats;
mod store;
mod warmup;
mod writer;

pub use background::{BackgroundTasks, TaskSlot};
pub use config::{CacheConfig, DEFAULT_KEY_PREFIX};
pub use distributed::{DistributedTier, MemoryTier, TierError};
pub use events::{CacheEvent, ClearScope, Epoch, EventKind, EventQueue, EventSink, NullSink};
pub use local::{CacheEntry, LocalLookup, LocalTier};
pub use middleware::{CacheLayerState, InvalidationState, cacheable, invalidate_on_write};
pub use namespace::NamespaceRouter;
pub use pattern::KeyPattern;
pub use payload::CachedPayload;
pub use policy::{EndpointPolicy, PolicyResolver};
pub use stats::{CacheStatistics, CacheStatsReport, CounterSnapshot};
pub use store::{CacheStore, DistributedHealth};
pub use warmup::{WarmupError, WarmupFailure, WarmupJob, WarmupReport};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid invalidation pattern `{pattern}`: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
}
