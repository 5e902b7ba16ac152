//! Bounded-concurrency job queue with priority lanes and a
//! runtime-selectable discharge order.
//!
//! Jobs land in one of three lanes. Discharge always drains high before
//! normal before low; within a lane, FIFO takes the oldest submission
//! and LIFO the newest. A semaphore caps how many discharged jobs run
//! at once, and suspension gates discharge without touching running
//! jobs.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc};
use tracing::trace;

use crate::options::{DownloadPriority, ExecutionOrder};

use super::job::DownloadJob;

/// Executes one discharged job to completion.
pub(crate) type JobRunner =
    Arc<dyn Fn(Arc<DownloadJob>) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) enum QueueCommand {
    Submit(Arc<DownloadJob>),
    Suspend(bool),
    SetOrder(ExecutionOrder),
}

#[derive(Default)]
pub(crate) struct Lanes {
    high: VecDeque<Arc<DownloadJob>>,
    normal: VecDeque<Arc<DownloadJob>>,
    low: VecDeque<Arc<DownloadJob>>,
}

impl Lanes {
    pub(crate) fn push(&mut self, job: Arc<DownloadJob>) {
        let lane = match job.priority() {
            DownloadPriority::High => &mut self.high,
            DownloadPriority::Normal => &mut self.normal,
            DownloadPriority::Low => &mut self.low,
        };
        lane.push_back(job);
    }

    pub(crate) fn pop(&mut self, order: ExecutionOrder) -> Option<Arc<DownloadJob>> {
        for lane in [&mut self.high, &mut self.normal, &mut self.low] {
            if lane.is_empty() {
                continue;
            }
            return match order {
                ExecutionOrder::Fifo => lane.pop_front(),
                ExecutionOrder::Lifo => lane.pop_back(),
            };
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}

/// Handle to the queue worker. Commands are processed in submission
/// order, so a suspend followed by submits followed by a resume stages
/// the submits deterministically.
pub(crate) struct JobQueue {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl JobQueue {
    pub(crate) fn new(
        max_concurrent: usize,
        order: ExecutionOrder,
        runner: JobRunner,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, max_concurrent.max(1), order, runner));
        Self { tx }
    }

    pub(crate) fn submit(&self, job: Arc<DownloadJob>) {
        let _ = self.tx.send(QueueCommand::Submit(job));
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        let _ = self.tx.send(QueueCommand::Suspend(suspended));
    }

    pub(crate) fn set_order(&self, order: ExecutionOrder) {
        let _ = self.tx.send(QueueCommand::SetOrder(order));
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<QueueCommand>,
    max_concurrent: usize,
    mut order: ExecutionOrder,
    runner: JobRunner,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut lanes = Lanes::default();
    let mut suspended = false;

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(QueueCommand::Submit(job)) => lanes.push(job),
                    Some(QueueCommand::Suspend(value)) => suspended = value,
                    Some(QueueCommand::SetOrder(value)) => order = value,
                    None => break,
                }
            }
            permit = semaphore.clone().acquire_owned(), if !suspended && !lanes.is_empty() => {
                let Ok(permit) = permit else { break };
                if let Some(job) = lanes.pop(order) {
                    // Jobs cancelled while queued never reach a worker.
                    if job.is_cancelled() {
                        trace!(url = job.url(), "skipping cancelled job");
                        drop(permit);
                        continue;
                    }
                    let run = runner(job);
                    tokio::spawn(async move {
                        run.await;
                        drop(permit);
                    });
                } else {
                    drop(permit);
                }
            }
        }
    }
}
