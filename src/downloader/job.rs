//! Per-URL download job: waiter set plus state machine.
//!
//! A job is the single transport operation behind every concurrent
//! request for one URL. Waiters attach a progress and a completion
//! callback; removing the last waiter cancels the job itself.
//!
//! ```text
//! queued ──start──▶ running ──bytes/progress──▶ running
//!    │                 │
//!    │                 ├── response-error ──▶ finishing(err) ──▶ done
//!    │                 ├── bytes-complete ──▶ decode ──▶ finishing(ok) ──▶ done
//!    │                 └── cancel ──▶ cancelled
//!    └── cancel ──▶ cancelled
//! ```
//!
//! Transitions are serialized on the job's mutex. Waiter add/remove is
//! safe concurrently with transitions and rejected once the job has
//! reached `Finishing`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use image::DynamicImage;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ImageError;
use crate::options::{DownloadOptions, DownloadPriority};

/// Progress callback: `(received_bytes, expected_bytes)`.
pub type DownloadProgress = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Completion callback. Called exactly once with `finished = true`
/// unless the job is cancelled; under progressive download it is also
/// called zero or more times before that with `finished = false`.
pub type DownloadCompleted = Arc<dyn Fn(DownloadOutcome) + Send + Sync>;

/// Payload delivered to a download completion callback.
#[derive(Clone)]
pub struct DownloadOutcome {
    /// The decoded image, absent on errors and suppressed cache hits.
    pub image: Option<Arc<DynamicImage>>,
    /// The raw downloaded bytes. Present only on the terminal delivery
    /// of a successful download.
    pub data: Option<Bytes>,
    /// The terminal error, if the download failed.
    pub error: Option<ImageError>,
    /// False only for intermediate progressive deliveries.
    pub finished: bool,
}

impl std::fmt::Debug for DownloadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOutcome")
            .field(
                "image",
                &self.image.as_ref().map(|i| (i.width(), i.height())),
            )
            .field("data_len", &self.data.as_ref().map(Bytes::len))
            .field("error", &self.error)
            .field("finished", &self.finished)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum JobState {
    Queued,
    Running,
    Finishing,
    Cancelled,
    Done,
}

pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) progress: Option<DownloadProgress>,
    pub(crate) completed: Option<DownloadCompleted>,
    /// Flipped when the waiter's token cancels; checked immediately
    /// before every delivery so a cancelled waiter observes nothing.
    pub(crate) cancelled: Arc<AtomicBool>,
}

/// Handle identifying one waiter on a job.
pub(crate) struct WaiterHandle {
    pub(crate) id: u64,
    pub(crate) cancelled: Arc<AtomicBool>,
}

/// Result of removing a waiter.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaiterRemoval {
    /// The waiter left; others remain.
    Removed,
    /// The last waiter left; the caller must cancel the job.
    RemovedLast,
    /// The job had already reached `Finishing`; cancel is a no-op and
    /// the terminal callback still fires.
    NoOp,
}

struct JobInner {
    state: JobState,
    waiters: Vec<Waiter>,
    received: u64,
    expected: Option<u64>,
}

pub(crate) struct DownloadJob {
    url: String,
    options: DownloadOptions,
    priority: DownloadPriority,
    inner: Mutex<JobInner>,
    cancel_tx: watch::Sender<bool>,
    next_waiter_id: AtomicU64,
}

impl DownloadJob {
    pub(crate) fn new(url: &str, options: DownloadOptions) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            url: url.to_string(),
            options,
            priority: DownloadPriority::from_options(options),
            inner: Mutex::new(JobInner {
                state: JobState::Queued,
                waiters: Vec::new(),
                received: 0,
                expected: None,
            }),
            cancel_tx,
            next_waiter_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn options(&self) -> DownloadOptions {
        self.options
    }

    pub(crate) fn priority(&self) -> DownloadPriority {
        self.priority
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> JobState {
        self.inner.lock().state
    }

    /// Registers a waiter. Returns `None` once the job has reached
    /// `Finishing`; late joiners then need a fresh job.
    pub(crate) fn add_waiter(
        &self,
        progress: Option<DownloadProgress>,
        completed: Option<DownloadCompleted>,
    ) -> Option<WaiterHandle> {
        let mut inner = self.inner.lock();
        if inner.state >= JobState::Finishing {
            return None;
        }
        let id = self.next_waiter_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        inner.waiters.push(Waiter {
            id,
            progress,
            completed,
            cancelled: cancelled.clone(),
        });
        Some(WaiterHandle { id, cancelled })
    }

    /// Removes one waiter and marks it cancelled.
    pub(crate) fn remove_waiter(&self, id: u64) -> WaiterRemoval {
        let mut inner = self.inner.lock();
        if inner.state >= JobState::Finishing {
            return WaiterRemoval::NoOp;
        }
        let Some(index) = inner.waiters.iter().position(|w| w.id == id) else {
            return WaiterRemoval::NoOp;
        };
        let waiter = inner.waiters.swap_remove(index);
        waiter.cancelled.store(true, Ordering::SeqCst);
        if inner.waiters.is_empty() {
            WaiterRemoval::RemovedLast
        } else {
            WaiterRemoval::Removed
        }
    }

    /// Cancels the job: the state becomes `Cancelled`, remaining
    /// waiters are marked cancelled, and the transport is signalled to
    /// abort. A no-op at `Finishing` or later.
    pub(crate) fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.state >= JobState::Finishing {
            return;
        }
        inner.state = JobState::Cancelled;
        for waiter in inner.waiters.drain(..) {
            waiter.cancelled.store(true, Ordering::SeqCst);
        }
        // send_replace reaches jobs that have no subscriber yet (still
        // queued) as well as running ones awaiting the change.
        self.cancel_tx.send_replace(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub(crate) fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Marks the job running. False when it was cancelled while queued.
    pub(crate) fn begin_running(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == JobState::Queued {
            inner.state = JobState::Running;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_expected(&self, expected: Option<u64>) {
        self.inner.lock().expected = expected;
    }

    pub(crate) fn record_bytes(&self, received: u64) {
        self.inner.lock().received = received;
    }

    /// Progress callbacks with their cancellation flags, plus the byte
    /// counters, for one progress round.
    pub(crate) fn progress_snapshot(
        &self,
    ) -> (Vec<(DownloadProgress, Arc<AtomicBool>)>, u64, Option<u64>) {
        let inner = self.inner.lock();
        let callbacks = inner
            .waiters
            .iter()
            .filter_map(|w| {
                w.progress
                    .as_ref()
                    .map(|p| (p.clone(), w.cancelled.clone()))
            })
            .collect();
        (callbacks, inner.received, inner.expected)
    }

    /// Completion callbacks with their cancellation flags, for
    /// intermediate progressive deliveries.
    pub(crate) fn completed_snapshot(&self) -> Vec<(DownloadCompleted, Arc<AtomicBool>)> {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter_map(|w| {
                w.completed
                    .as_ref()
                    .map(|c| (c.clone(), w.cancelled.clone()))
            })
            .collect()
    }

    /// Transitions to `Finishing` and drains the waiters for terminal
    /// delivery. Empty when the job was cancelled first.
    pub(crate) fn begin_finishing(&self) -> Vec<Waiter> {
        let mut inner = self.inner.lock();
        if inner.state >= JobState::Finishing {
            return Vec::new();
        }
        inner.state = JobState::Finishing;
        std::mem::take(&mut inner.waiters)
    }

    /// Terminal transition after deliveries are enqueued.
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock();
        if inner.state == JobState::Finishing {
            inner.state = JobState::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Arc<DownloadJob> {
        DownloadJob::new("https://example.com/a.png", DownloadOptions::empty())
    }

    #[test]
    fn waiters_accumulate_until_finishing() {
        let job = job();
        let first = job.add_waiter(None, None).unwrap();
        let second = job.add_waiter(None, None).unwrap();
        assert_ne!(first.id, second.id);

        assert!(job.begin_running());
        assert!(job.add_waiter(None, None).is_some());

        let drained = job.begin_finishing();
        assert_eq!(drained.len(), 3);
        assert!(job.add_waiter(None, None).is_none());
    }

    #[test]
    fn removing_the_last_waiter_reports_it() {
        let job = job();
        let first = job.add_waiter(None, None).unwrap();
        let second = job.add_waiter(None, None).unwrap();

        assert_eq!(job.remove_waiter(first.id), WaiterRemoval::Removed);
        assert!(first.cancelled.load(Ordering::SeqCst));
        assert!(!second.cancelled.load(Ordering::SeqCst));
        assert_eq!(job.remove_waiter(second.id), WaiterRemoval::RemovedLast);
    }

    #[test]
    fn cancel_marks_job_and_remaining_waiters() {
        let job = job();
        let waiter = job.add_waiter(None, None).unwrap();

        job.cancel();
        assert!(job.is_cancelled());
        assert_eq!(job.state(), JobState::Cancelled);
        assert!(waiter.cancelled.load(Ordering::SeqCst));
        assert!(!job.begin_running());
        assert!(job.begin_finishing().is_empty());
    }

    #[test]
    fn cancel_after_finishing_is_a_no_op() {
        let job = job();
        let waiter = job.add_waiter(None, None).unwrap();
        assert!(job.begin_running());
        let drained = job.begin_finishing();
        assert_eq!(drained.len(), 1);

        assert_eq!(job.remove_waiter(waiter.id), WaiterRemoval::NoOp);
        job.cancel();
        assert!(!job.is_cancelled());

        job.finish();
        assert_eq!(job.state(), JobState::Done);
    }

    #[test]
    fn byte_counters_flow_to_snapshots() {
        let job = job();
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        let progress: DownloadProgress = Arc::new(move |received, expected| {
            assert_eq!(received, 10);
            assert_eq!(expected, Some(100));
            flag.store(true, Ordering::SeqCst);
        });
        let _handle = job.add_waiter(Some(progress), None).unwrap();

        job.set_expected(Some(100));
        job.record_bytes(10);

        let (callbacks, received, expected) = job.progress_snapshot();
        assert_eq!(callbacks.len(), 1);
        for (callback, _) in callbacks {
            callback(received, expected);
        }
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn priority_comes_from_options() {
        let job = DownloadJob::new("u", DownloadOptions::HIGH_PRIORITY);
        assert_eq!(job.priority(), DownloadPriority::High);
    }
}
