//! Observational download notifications.
//!
//! Events describe the lifecycle of download jobs for dashboards and
//! logging. They are fan-out and lossy under lag; correctness never
//! depends on them.

use tokio::sync::broadcast;

/// Lifecycle event of a download job.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// The job started executing. Precedes all of its bytes.
    Started {
        /// The job's URL.
        url: String,
    },
    /// The transport produced a response header.
    ReceivedResponse {
        /// The job's URL.
        url: String,
        /// HTTP status of the response.
        status: u16,
    },
    /// The job stopped executing, successfully or not. Follows all of
    /// its bytes.
    Stopped {
        /// The job's URL.
        url: String,
    },
    /// The job downloaded and decoded its image successfully.
    Finished {
        /// The job's URL.
        url: String,
    },
}

impl DownloadEvent {
    /// The URL the event refers to.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Started { url }
            | Self::ReceivedResponse { url, .. }
            | Self::Stopped { url }
            | Self::Finished { url } => url,
        }
    }
}

/// Broadcast hub for [`DownloadEvent`]s.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<DownloadEvent>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: DownloadEvent) {
        // No receivers is the normal case; events are observational.
        let _ = self.tx.send(event);
    }
}
