//! Progress events and cooperative cancellation.
//!
//! The event channel is bounded and lossy: [`ProgressSender::send`] never
//! waits. When the consumer falls behind, the newest event is dropped and only
//! counted. Progress is a UI hint; the [`crate::install::InstallReport`] of a
//! run is the authoritative record of what completed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::types::PackageReference;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Completed packages over packages to fetch, `0.0..=1.0`.
    Overall(f64),
    ModDownload(PackageReference, f64),
    ModExtract(PackageReference, f64),
    ModComplete(PackageReference),
    ModFailed(PackageReference, String),
}

/// Create a progress channel holding at most `capacity` undelivered events.
pub fn progress_channel(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        ProgressReceiver { rx },
    )
}

#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

impl ProgressSender {
    /// Try to enqueue `event`. Returns false when it was dropped because the
    /// buffer is full or the receiver is gone.
    pub fn send(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("Progress consumer is behind, dropped {:?} ({} total)", event, total);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Number of events dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Wait for the next event; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued and return the most recent event.
    pub fn latest(&mut self) -> Option<ProgressEvent> {
        let mut last = None;
        while let Ok(event) = self.rx.try_recv() {
            last = Some(event);
        }
        last
    }
}

/// Receives byte counts from long-running transfers.
pub trait ProgressObserver: Send + Sync {
    fn update_bytes(&self, transferred: u64, total: Option<u64>);
}

/// An observer that ignores every update.
pub struct SilentObserver;

impl ProgressObserver for SilentObserver {
    fn update_bytes(&self, _transferred: u64, _total: Option<u64>) {}
}

/// Requests cancellation of a run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation token checked between packages.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken::new(rx))
}
