//! Ordered distributed writes.
//!
//! `SETEX` commands leave the request path through one queue drained by a
//! single task, so they reach the tier in call order. Removals wait on a
//! barrier in the same queue before touching the tier, which keeps a write
//! queued ahead of an invalidation from landing after it.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, debug_span, warn};

use super::background::TaskSlot;
use super::distributed::DistributedTier;
use super::store::report_tier_error;

enum WriteCommand {
    Set {
        key: String,
        value: Bytes,
        ttl_secs: u64,
        slot: TaskSlot,
    },
    Barrier(oneshot::Sender<()>),
}

pub(super) struct DistributedWriter {
    queue: mpsc::UnboundedSender<WriteCommand>,
}

impl DistributedWriter {
    /// Start the drain task. It stops once the writer is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub(super) fn spawn(tier: Arc<dyn DistributedTier>) -> Self {
        let (queue, mut commands) = mpsc::unbounded_channel();
        tokio::spawn(
            async move {
                while let Some(command) = commands.recv().await {
                    match command {
                        WriteCommand::Set {
                            key,
                            value,
                            ttl_secs,
                            slot: _slot,
                        } => {
                            if let Err(err) = tier.set_ex(&key, value, ttl_secs).await {
                                report_tier_error("set", &err);
                            }
                        }
                        WriteCommand::Barrier(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!("distributed writer stopped");
            }
            .instrument(debug_span!("distributed_writer")),
        );
        Self { queue }
    }

    pub(super) fn set(&self, key: String, value: Bytes, ttl_secs: u64, slot: TaskSlot) {
        let command = WriteCommand::Set {
            key,
            value,
            ttl_secs,
            slot,
        };
        if self.queue.send(command).is_err() {
            warn!("distributed writer is gone, dropping write");
        }
    }

    /// Resolves once every write queued before this call has been applied.
    pub(super) async fn settled(&self) {
        let (done, applied) = oneshot::channel();
        if self.queue.send(WriteCommand::Barrier(done)).is_ok() {
            let _ = applied.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::BackgroundTasks;
    use crate::cache::distributed::{MemoryTier, TierError};

    /// Delays every `SETEX` so a later command could overtake it if the queue
    /// did not serialise them.
    struct SlowTier {
        inner: MemoryTier,
    }

    #[async_trait]
    impl DistributedTier for SlowTier {
        fn is_available(&self) -> bool {
            true
        }

        async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError> {
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<(), TierError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.set_ex(key, value, ttl_secs).await
        }

        async fn delete(&self, keys: &[String]) -> Result<usize, TierError> {
            self.inner.delete(keys).await
        }

        async fn keys(&self, glob: &str) -> Result<Vec<String>, TierError> {
            self.inner.keys(glob).await
        }

        async fn flush_db(&self) -> Result<(), TierError> {
            self.inner.flush_db().await
        }

        async fn info(&self) -> Result<String, TierError> {
            self.inner.info().await
        }

        async fn db_size(&self) -> Result<u64, TierError> {
            self.inner.db_size().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writes_apply_in_call_order_before_barrier() {
        let tier = Arc::new(SlowTier {
            inner: MemoryTier::new(),
        });
        let tasks = BackgroundTasks::new();
        let writer = DistributedWriter::spawn(tier.clone());

        writer.set("k".into(), Bytes::from_static(b"first"), 60, tasks.hold());
        writer.set("k".into(), Bytes::from_static(b"second"), 60, tasks.hold());
        assert_eq!(tasks.in_flight(), 2);

        writer.settled().await;
        assert_eq!(tasks.in_flight(), 0);
        assert_eq!(
            tier.get("k").await.expect("get succeeds"),
            Some(Bytes::from_static(b"second"))
        );
    }
}
