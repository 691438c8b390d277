//! Detached cache work.
//!
//! Write-triggered invalidation and access counting run here instead of on
//! the request path, and queued distributed writes hold a slot until applied.
//! Callers get no completion signal; the in-flight count only lets shutdown
//! and tests wait for the work to settle.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span};

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Counts as in-flight work until dropped.
pub struct TaskSlot(Arc<Inner>);

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` detached from the caller.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, label: &'static str, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.hold();
        tokio::spawn(
            async move {
                let _guard = guard;
                work.await;
                debug!("background cache task finished");
            }
            .instrument(debug_span!("cache_background", task = label)),
        )
    }

    /// Register work that runs outside [`spawn`](Self::spawn), such as a
    /// command waiting in a queue.
    pub fn hold(&self) -> TaskSlot {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        TaskSlot(self.inner.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no spawned work is running, including work spawned while
    /// waiting.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
