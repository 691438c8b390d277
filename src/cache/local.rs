//! In-process cache tier.
//!
//! Entries carry their own TTL and are checked for liveness when read. Nothing
//! evicts live entries; expired ones are dropped on the next read of the same
//! key, by [`LocalTier::sweep_expired`], or by a full clear.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::lock::{rw_read, rw_write};

const COMPONENT: &str = "cache::local";

/// A payload stored in the local tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Bytes,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(payload: Bytes, ttl: Duration) -> Self {
        Self {
            payload,
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// An entry is live while `now - stored_at <= ttl`.
    pub fn is_live_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

/// Outcome of a local lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalLookup {
    Hit(Bytes),
    /// The key was present but stale; it has been removed.
    Expired,
    Absent,
}

/// Keyed in-process map with lazy expiry.
#[derive(Default)]
pub struct LocalTier {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl LocalTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> LocalLookup {
        let now = Instant::now();
        {
            let entries = rw_read(&self.entries, COMPONENT, "get");
            match entries.get(key) {
                None => return LocalLookup::Absent,
                Some(entry) if entry.is_live_at(now) => {
                    return LocalLookup::Hit(entry.payload.clone());
                }
                Some(_) => {}
            }
        }

        // Re-check under the write lock: a concurrent set may have replaced the
        // stale entry between the two acquisitions.
        let mut entries = rw_write(&self.entries, COMPONENT, "get.expire");
        match entries.get(key) {
            Some(entry) if entry.is_live_at(now) => LocalLookup::Hit(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                LocalLookup::Expired
            }
            None => LocalLookup::Absent,
        }
    }

    /// Store `payload` under `key`, replacing any previous entry wholesale.
    pub fn insert(&self, key: String, payload: Bytes, ttl: Duration) {
        rw_write(&self.entries, COMPONENT, "insert").insert(key, CacheEntry::new(payload, ttl));
    }

    pub fn remove(&self, key: &str) -> bool {
        rw_write(&self.entries, COMPONENT, "remove")
            .remove(key)
            .is_some()
    }

    /// Remove every key accepted by `predicate`, returning the removed keys.
    ///
    /// Walks the whole map; meant for administrative and write paths only.
    pub fn remove_matching(&self, mut predicate: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut entries = rw_write(&self.entries, COMPONENT, "remove_matching");
        let doomed: Vec<String> = entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        doomed
    }

    /// Drop every entry that is no longer live. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, COMPONENT, "sweep_expired");
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live_at(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        rw_write(&self.entries, COMPONENT, "clear").clear();
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, COMPONENT, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        rw_read(&self.entries, COMPONENT, "contains").contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn ttl(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_live_up_to_and_including_ttl() {
        let tier = LocalTier::new();
        tier.insert("k".into(), Bytes::from_static(b"v"), ttl(1_000));

        tokio::time::advance(ttl(1_000)).await;
        assert_eq!(tier.get("k"), LocalLookup::Hit(Bytes::from_static(b"v")));

        tokio::time::advance(ttl(1)).await;
        assert_eq!(tier.get("k"), LocalLookup::Expired);
        assert!(!tier.contains("k"));
        assert_eq!(tier.get("k"), LocalLookup::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_entry_is_readable_immediately() {
        let tier = LocalTier::new();
        tier.insert("k".into(), Bytes::from_static(b"v"), Duration::ZERO);
        assert!(matches!(tier.get("k"), LocalLookup::Hit(_)));

        tokio::time::advance(ttl(1)).await;
        assert_eq!(tier.get("k"), LocalLookup::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_replaces_payload_and_resets_clock() {
        let tier = LocalTier::new();
        tier.insert("k".into(), Bytes::from_static(b"one"), ttl(100));
        tokio::time::advance(ttl(80)).await;
        tier.insert("k".into(), Bytes::from_static(b"two"), ttl(100));
        tokio::time::advance(ttl(80)).await;

        assert_eq!(tier.get("k"), LocalLookup::Hit(Bytes::from_static(b"two")));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn remove_matching_only_touches_accepted_keys() {
        let tier = LocalTier::new();
        for key in ["produtos:/a", "produtos:/b", "estoque:/a"] {
            tier.insert(key.into(), Bytes::new(), ttl(1_000));
        }

        let mut removed = tier.remove_matching(|key| key.starts_with("produtos:"));
        removed.sort();

        assert_eq!(removed, vec!["produtos:/a", "produtos:/b"]);
        assert!(tier.contains("estoque:/a"));
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_only_expired_entries() {
        let tier = LocalTier::new();
        tier.insert("short".into(), Bytes::new(), ttl(10));
        tier.insert("long".into(), Bytes::new(), ttl(10_000));

        tokio::time::advance(ttl(11)).await;

        assert_eq!(tier.sweep_expired(), 1);
        assert!(tier.contains("long"));
        assert!(!tier.contains("short"));
    }

    #[test]
    fn local_tier_recovers_from_poisoned_lock() {
        let tier = LocalTier::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = tier.entries.write().expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        tier.insert("k".into(), Bytes::from_static(b"v"), ttl(1_000));
        assert_eq!(tier.len(), 1);
    }
}
