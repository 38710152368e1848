//! Send-side backpressure for the `files` stream (`spec.md` §4.5).
//!
//! WebRTC data channels expose a `bufferedAmount` threshold event; QUIC
//! send streams don't, so callers report how much they've queued and this
//! tracker decides when sending should pause or resume. A 30 s safety
//! timeout unblocks sending even if nothing ever calls
//! [`Backpressure::report_drained`], to avoid deadlocking on a channel
//! that's already gone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Pause sending once queued bytes exceed this.
pub const HIGH_WATERMARK: usize = 1024 * 1024;

/// Resume sending once queued bytes drop to this or below.
pub const LOW_WATERMARK: usize = 256 * 1024;

/// Safety timeout: if no drain notification arrives within this long,
/// unblock anyway.
pub const SAFETY_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracks queued bytes for one outbound stream and gates sends against the
/// high/low watermarks.
pub struct Backpressure {
    queued_bytes: AtomicUsize,
    notify: Notify,
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::new()
    }
}

impl Backpressure {
    pub fn new() -> Self {
        Self {
            queued_bytes: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Call after queuing `len` bytes for send.
    pub fn report_queued(&self, len: usize) {
        self.queued_bytes.fetch_add(len, Ordering::SeqCst);
    }

    /// Call after `len` bytes have actually gone out (stream flushed them).
    /// Wakes any waiter if we've drained back to the low watermark.
    pub fn report_drained(&self, len: usize) {
        let prev = self.queued_bytes.fetch_sub(len, Ordering::SeqCst);
        if prev.saturating_sub(len) <= LOW_WATERMARK {
            self.notify.notify_waiters();
        }
    }

    pub fn queued(&self) -> usize {
        self.queued_bytes.load(Ordering::SeqCst)
    }

    /// Block the caller until queued bytes are at or below the low
    /// watermark, if currently above the high watermark. Returns
    /// immediately if already below the high watermark. Never blocks
    /// longer than [`SAFETY_TIMEOUT`].
    pub async fn wait_for_capacity(&self) {
        if self.queued() <= HIGH_WATERMARK {
            return;
        }
        let notified = self.notify.notified();
        if self.queued() <= LOW_WATERMARK {
            return;
        }
        // Ignore the timeout result either way: on elapse we proceed rather
        // than deadlock on a channel that's already gone.
        let _ = tokio::time::timeout(SAFETY_TIMEOUT, notified).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn capacity_available_below_high_watermark_returns_immediately() {
        let bp = Backpressure::new();
        bp.report_queued(100);
        tokio::time::timeout(Duration::from_millis(50), bp.wait_for_capacity())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn wait_unblocks_on_drain_below_low_watermark() {
        let bp = Arc::new(Backpressure::new());
        bp.report_queued(HIGH_WATERMARK + 1);

        let waiter = {
            let bp = bp.clone();
            tokio::spawn(async move {
                bp.wait_for_capacity().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        bp.report_drained(HIGH_WATERMARK + 1 - LOW_WATERMARK / 2);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .expect("task should not panic");
    }

    #[test]
    fn report_queued_and_drained_track_total() {
        let bp = Backpressure::new();
        bp.report_queued(500);
        bp.report_queued(200);
        assert_eq!(bp.queued(), 700);
        bp.report_drained(300);
        assert_eq!(bp.queued(), 400);
    }
}
