//! Redis-backed distributed tier.
//!
//! One multiplexed connection is shared by every caller. Connecting is
//! bounded by a timeout and retried with capped exponential backoff; once the
//! retries are spent the tier reports itself unavailable and the supervisor
//! keeps probing in the background until the server comes back.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use redis::{AsyncCommands, RedisResult, aio::MultiplexedConnection};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{DistributedTier, TierError};
use crate::config::DistributedSettings;

use super::error::InfraError;

const METRIC_RECONNECT_TOTAL: &str = "balcao_redis_reconnect_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisTierConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub probe_interval: Duration,
}

impl RedisTierConfig {
    /// `None` when no URL is configured.
    pub fn from_settings(settings: &DistributedSettings) -> Option<Self> {
        let url = settings.url.as_ref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some(Self {
            url: url.to_string(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            response_timeout: Duration::from_millis(settings.response_timeout_ms),
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
            probe_interval: Duration::from_millis(settings.probe_interval_ms),
        })
    }
}

/// Delay before each retry: `base * 2^n`, capped at `max`.
pub fn backoff_schedule(base: Duration, max: Duration, retries: u32) -> Vec<Duration> {
    let mut delays = Vec::with_capacity(retries as usize);
    let mut delay = base;
    for _ in 0..retries {
        delays.push(delay.min(max));
        delay = delay.saturating_mul(2);
    }
    delays
}

pub struct RedisTier {
    client: redis::Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    available: AtomicBool,
    config: RedisTierConfig,
}

impl RedisTier {
    /// Parse the URL. No connection is made yet.
    pub fn open(config: RedisTierConfig) -> Result<Arc<Self>, InfraError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| InfraError::redis(format!("invalid redis url: {err}")))?;
        Ok(Arc::new(Self {
            client,
            connection: RwLock::new(None),
            available: AtomicBool::new(false),
            config,
        }))
    }

    /// Connect, retrying with backoff. Returns whether the tier is usable.
    pub async fn connect(&self) -> bool {
        let delays = backoff_schedule(
            self.config.backoff_base,
            self.config.backoff_max,
            self.config.max_retries,
        );

        let mut attempt = 0usize;
        loop {
            match self.try_connect().await {
                Ok(connection) => {
                    *self.connection.write().await = Some(connection);
                    self.available.store(true, Ordering::SeqCst);
                    info!(
                        target = "balcao::infra::redis",
                        attempt,
                        "distributed tier connected"
                    );
                    return true;
                }
                Err(err) => {
                    let Some(delay) = delays.get(attempt).copied() else {
                        warn!(
                            target = "balcao::infra::redis",
                            attempts = attempt + 1,
                            error = %err,
                            "distributed tier unreachable, continuing with local cache only"
                        );
                        self.available.store(false, Ordering::SeqCst);
                        return false;
                    };
                    counter!(METRIC_RECONNECT_TOTAL).increment(1);
                    debug!(
                        target = "balcao::infra::redis",
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "redis connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Probe periodically: reconnect while unavailable, `PING` while
    /// available so a silently dead server is noticed.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let tier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tier.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tier.is_available() {
                    let _ = tier.ping().await;
                } else {
                    tier.connect().await;
                }
            }
        })
    }

    pub async fn ping(&self) -> Result<(), TierError> {
        self.run(|mut conn| async move {
            let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            pong.map(|_| ())
        })
        .await
    }

    async fn try_connect(&self) -> Result<MultiplexedConnection, TierError> {
        match timeout(
            self.config.connect_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(err)) => Err(TierError::Command(err.to_string())),
            Err(_) => Err(TierError::Timeout(self.config.connect_timeout)),
        }
    }

    fn mark_unavailable(&self, reason: &str) {
        if self.available.swap(false, Ordering::SeqCst) {
            warn!(
                target = "balcao::infra::redis",
                reason,
                "distributed tier marked unavailable"
            );
        }
    }

    async fn run<T, F, Fut>(&self, command: F) -> Result<T, TierError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        if !self.is_available() {
            return Err(TierError::Unavailable);
        }
        let Some(connection) = self.connection.read().await.clone() else {
            return Err(TierError::Unavailable);
        };

        match timeout(self.config.response_timeout, command(connection)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
                {
                    self.mark_unavailable("connection error");
                }
                Err(TierError::Command(err.to_string()))
            }
            Err(_) => {
                self.mark_unavailable("response timeout");
                Err(TierError::Timeout(self.config.response_timeout))
            }
        }
    }
}

#[async_trait]
impl DistributedTier for RedisTier {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError> {
        let key = key.to_string();
        let value = self
            .run(|mut conn| async move { conn.get::<_, Option<Vec<u8>>>(key).await })
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<(), TierError> {
        let key = key.to_string();
        self.run(|mut conn| async move {
            conn.set_ex::<_, _, ()>(key, value.as_ref(), ttl_secs).await
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, TierError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.to_vec();
        self.run(|mut conn| async move { conn.del::<_, usize>(keys).await })
            .await
    }

    async fn keys(&self, glob: &str) -> Result<Vec<String>, TierError> {
        let glob = glob.to_string();
        self.run(|mut conn| async move { conn.keys::<_, Vec<String>>(glob).await })
            .await
    }

    async fn flush_db(&self) -> Result<(), TierError> {
        self.run(|mut conn| async move {
            let flushed: RedisResult<()> = redis::cmd("FLUSHDB").query_async(&mut conn).await;
            flushed
        })
        .await
    }

    async fn info(&self) -> Result<String, TierError> {
        self.run(|mut conn| async move {
            let info: RedisResult<String> = redis::cmd("INFO").query_async(&mut conn).await;
            info
        })
        .await
    }

    async fn db_size(&self) -> Result<u64, TierError> {
        self.run(|mut conn| async move {
            let size: RedisResult<u64> = redis::cmd("DBSIZE").query_async(&mut conn).await;
            size
        })
        .await
    }
}
