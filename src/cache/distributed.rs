//! Distributed cache tier contract.
//!
//! The tier is optional and may drop out at any time. Every method reports
//! failure through [`TierError`]; callers in the store log and swallow it.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

use super::lock::{rw_read, rw_write};

const COMPONENT: &str = "cache::distributed";

#[derive(Debug, Error)]
pub enum TierError {
    #[error("distributed tier is unavailable")]
    Unavailable,
    #[error("distributed tier timed out after {0:?}")]
    Timeout(Duration),
    #[error("distributed tier command failed: {0}")]
    Command(String),
}

/// Primitive operations required from the shared backend.
///
/// Keys passed here are already fully qualified (prefix included).
#[async_trait]
pub trait DistributedTier: Send + Sync {
    /// Whether the tier is currently believed reachable. Cheap; no I/O.
    fn is_available(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError>;

    /// `SETEX key ttl_secs value`.
    async fn set_ex(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<(), TierError>;

    /// `DEL key...`; returns how many keys existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, TierError>;

    /// `KEYS glob`.
    async fn keys(&self, glob: &str) -> Result<Vec<String>, TierError>;

    async fn flush_db(&self) -> Result<(), TierError>;

    /// Raw `INFO` output.
    async fn info(&self) -> Result<String, TierError>;

    async fn db_size(&self) -> Result<u64, TierError>;
}

/// Parse `INFO` output into `field -> value`, skipping section headers.
pub fn parse_info(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .collect()
}

/// Match `key` against a `KEYS`-style glob (`*`, `?`, and `\` escapes).
pub fn glob_matches(glob: &str, key: &str) -> bool {
    let pattern: Vec<GlobToken> = tokenize_glob(glob);
    let key: Vec<char> = key.chars().collect();

    // Classic wildcard matching with single-star backtracking.
    let (mut p, mut k) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while k < key.len() {
        match pattern.get(p) {
            Some(GlobToken::Any) => {
                star = Some((p, k));
                p += 1;
            }
            Some(GlobToken::One) => {
                p += 1;
                k += 1;
            }
            Some(GlobToken::Literal(ch)) if *ch == key[k] => {
                p += 1;
                k += 1;
            }
            _ => match star {
                Some((star_p, star_k)) => {
                    p = star_p + 1;
                    k = star_k + 1;
                    star = Some((star_p, star_k + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|token| *token == GlobToken::Any)
}

#[derive(Debug, PartialEq, Eq)]
enum GlobToken {
    Any,
    One,
    Literal(char),
}

fn tokenize_glob(glob: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::with_capacity(glob.len());
    let mut chars = glob.chars();
    while let Some(ch) = chars.next() {
        tokens.push(match ch {
            '*' => GlobToken::Any,
            '?' => GlobToken::One,
            '\\' => GlobToken::Literal(chars.next().unwrap_or('\\')),
            other => GlobToken::Literal(other),
        });
    }
    tokens
}

/// In-process stand-in for a shared backend.
///
/// Useful for single-node runs and for exercising degraded mode: flipping
/// [`MemoryTier::set_available`] to `false` makes every operation fail the
/// same way an unreachable server would.
#[derive(Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<String, (Bytes, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        rw_read(&self.entries, COMPONENT, "contains").contains_key(key)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, COMPONENT, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), TierError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TierError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DistributedTier for MemoryTier {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, COMPONENT, "get");
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<(), TierError> {
        self.ensure_available()?;
        if ttl_secs == 0 {
            return Err(TierError::Command(
                "invalid expire time in 'setex' command".to_string(),
            ));
        }
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        rw_write(&self.entries, COMPONENT, "set_ex").insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, TierError> {
        self.ensure_available()?;
        let mut entries = rw_write(&self.entries, COMPONENT, "delete");
        Ok(keys
            .iter()
            .filter(|key| entries.remove(key.as_str()).is_some())
            .count())
    }

    async fn keys(&self, glob: &str) -> Result<Vec<String>, TierError> {
        self.ensure_available()?;
        Ok(rw_read(&self.entries, COMPONENT, "keys")
            .keys()
            .filter(|key| glob_matches(glob, key))
            .cloned()
            .collect())
    }

    async fn flush_db(&self) -> Result<(), TierError> {
        self.ensure_available()?;
        rw_write(&self.entries, COMPONENT, "flush_db").clear();
        Ok(())
    }

    async fn info(&self) -> Result<String, TierError> {
        self.ensure_available()?;
        Ok(format!(
            "# Server\r\nredis_version:memory\r\n# Keyspace\r\nkeys:{}\r\n",
            self.len()
        ))
    }

    async fn db_size(&self) -> Result<u64, TierError> {
        self.ensure_available()?;
        Ok(self.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_supports_star_question_and_escapes() {
        assert!(glob_matches("balcao:*produtos*", "balcao:produtos:/api/produtos"));
        assert!(!glob_matches("balcao:*produtos*", "other:produtos"));
        assert!(glob_matches("a?c", "abc"));
        assert!(!glob_matches("a?c", "ac"));
        assert!(glob_matches("a\\?c", "a?c"));
        assert!(!glob_matches("a\\?c", "abc"));
        assert!(glob_matches("*", ""));
        assert!(glob_matches("x*y*z", "x--y--z"));
        assert!(!glob_matches("x*y*z", "x--z--y"));
    }

    #[test]
    fn info_parser_skips_sections() {
        let parsed = parse_info("# Server\r\nredis_version:7.2.4\r\nuptime_in_seconds:12\r\n\r\n");
        assert_eq!(parsed.get("redis_version").map(String::as_str), Some("7.2.4"));
        assert_eq!(parsed.get("uptime_in_seconds").map(String::as_str), Some("12"));
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_tier_expires_by_seconds() {
        let tier = MemoryTier::new();
        tier.set_ex("k", Bytes::from_static(b"v"), 2)
            .await
            .expect("set succeeds");

        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert!(tier.get("k").await.expect("get succeeds").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(tier.get("k").await.expect("get succeeds").is_none());
    }

    #[tokio::test]
    async fn unavailable_memory_tier_fails_every_operation() {
        let tier = MemoryTier::new();
        tier.set_available(false);

        assert!(!tier.is_available());
        assert!(matches!(tier.get("k").await, Err(TierError::Unavailable)));
        assert!(matches!(
            tier.set_ex("k", Bytes::new(), 1).await,
            Err(TierError::Unavailable)
        ));
        assert!(matches!(tier.keys("*").await, Err(TierError::Unavailable)));
    }
}
