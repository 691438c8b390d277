//! Cache lifecycle events.
//!
//! Events are informational. Publishing never blocks, never fails, and carries
//! no ordering or delivery guarantee for consumers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::lock::mutex_lock;

const COMPONENT: &str = "cache::events";
const METRIC_EVENT_DROPPED_TOTAL: &str = "balcao_cache_event_dropped_total";
pub const DEFAULT_EVENT_BUFFER: usize = 256;

pub type Epoch = u64;

#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    pub id: Uuid,
    pub epoch: Epoch,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ConfigUpdated { endpoint: String },
    ConfigDeleted { endpoint: String },
    CacheCleared { scope: ClearScope },
    PatternInvalidated { pattern: String, matched: usize },
    NamespaceCleared { namespace: String, removed: usize },
    CacheWarmed { warmed: usize, failed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearScope {
    /// Local tier and statistics only.
    Local,
    /// Local tier plus every distributed key under the cache prefix.
    Prefixed,
    /// Local tier plus a flush of the whole distributed database.
    FlushedDatabase,
}

/// Destination for cache lifecycle events.
pub trait EventSink: Send + Sync {
    fn publish(&self, kind: EventKind);
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _kind: EventKind) {}
}

/// Bounded in-memory buffer of recent events.
///
/// When full, the oldest event is discarded to make room.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::new_with_limit(DEFAULT_EVENT_BUFFER)
    }

    pub fn new_with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(limit.min(DEFAULT_EVENT_BUFFER))),
            epoch_counter: AtomicU64::new(0),
            limit,
        }
    }

    fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Up to `limit` of the most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<CacheEvent> {
        let queue = mutex_lock(&self.queue, COMPONENT, "recent");
        let skip = queue.len().saturating_sub(limit);
        queue.iter().skip(skip).cloned().collect()
    }

    /// Remove and return up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, COMPONENT, "drain");
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, COMPONENT, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventQueue {
    fn publish(&self, kind: EventKind) {
        let event = CacheEvent::new(kind, self.next_epoch());

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Cache event published"
        );

        let mut queue = mutex_lock(&self.queue, COMPONENT, "publish");
        if queue.len() >= self.limit {
            queue.pop_front();
            counter!(METRIC_EVENT_DROPPED_TOTAL).increment(1);
        }
        queue.push_back(event);
    }
}
