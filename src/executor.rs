//! Serialized executors backing the delivery and disk I/O queues.
//!
//! Both are single-consumer queues drained by one spawned task, so work
//! submitted to an executor runs in submission order, one item at a time.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::trace;

/// Runs submitted futures strictly one at a time, in submission order.
///
/// The disk tier owns one of these: every read, write, delete, and purge
/// goes through it, which makes per-key disk operations observe
/// submission order without any file-level locking.
#[derive(Clone)]
pub(crate) struct SerialExecutor {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SerialExecutor {
    /// Spawns the drain task. Must be called from within a Tokio runtime.
    pub(crate) fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            trace!(queue = name, "serial executor drained and closed");
        });
        Self { tx }
    }

    /// Enqueues a future. Dropped silently if the executor has shut down.
    pub(crate) fn submit<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.send(Box::pin(future));
    }
}

/// The callback delivery queue: the crate's rendering of a main thread.
///
/// Every user-facing progress and completion callback is invoked from
/// this queue's drain task, in submission order. Cancellation flags are
/// re-checked by the submitted closure itself, immediately before the
/// user callback runs, so a cancelled request never observes a delivery
/// that was already in flight.
#[derive(Clone)]
pub(crate) struct Deliverer {
    tx: mpsc::UnboundedSender<Box<dyn FnOnce() + Send>>,
}

impl Deliverer {
    /// Spawns the drain task. Must be called from within a Tokio runtime.
    pub(crate) fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn FnOnce() + Send>>();
        tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback();
            }
        });
        Self { tx }
    }

    /// Enqueues a callback invocation.
    pub(crate) fn deliver<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.tx.send(Box::new(callback));
    }
}
