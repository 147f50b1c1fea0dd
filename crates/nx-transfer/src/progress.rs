/// Progress reporting and cooperative cancellation.
///
/// The transfer engine emits one [`ProgressEvent`] per chunk. Observers may
/// coalesce events but always see the final one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cumulative bytes moved against the declared total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl ProgressEvent {
    pub fn new(bytes_transferred: u64, total_bytes: u64) -> Self {
        Self {
            bytes_transferred,
            total_bytes,
        }
    }

    /// Progress as a fraction 0.0 - 1.0. An empty transfer counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64).min(1.0)
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_bytes
    }
}

/// Receives progress events from a running transfer.
pub trait ProgressObserver {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(ProgressEvent),
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Forwards events to another thread. A disconnected receiver is ignored so a
/// closed UI never fails a transfer.
impl ProgressObserver for crossbeam_channel::Sender<ProgressEvent> {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

/// Observer that discards all events.
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Transfer statistics for lock-free polling from a UI thread.
pub struct TransferStats {
    pub bytes_transferred: AtomicU64,
    pub total_bytes: AtomicU64,
    pub events: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            bytes_transferred: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            events: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> ProgressEvent {
        ProgressEvent::new(
            self.bytes_transferred.load(Ordering::Relaxed),
            self.total_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn reset(&self) {
        self.bytes_transferred.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.events.store(0, Ordering::Relaxed);
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for TransferStats {
    fn on_progress(&self, event: ProgressEvent) {
        self.total_bytes.store(event.total_bytes, Ordering::Relaxed);
        self.bytes_transferred
            .store(event.bytes_transferred, Ordering::Relaxed);
        self.events.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cooperative stop signal shared between a transfer and its controller.
///
/// Checked between chunks and while polling for peers, never mid-chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
