//! Peer transport abstraction.
//!
//! A [`Channel`] is one ordered, reliable, message-based connection between
//! two peers. It mirrors the shape of a WebRTC data channel:
//!
//! - `send` enqueues a message without waiting for the network;
//! - `buffered_amount` reports bytes queued but not yet flushed;
//! - `buffered_amount_low` resolves once the queue has drained to the
//!   configured low-water threshold;
//! - `recv` yields inbound messages in order, `None` once closed.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryChannel`] - in-process pair, buffered amount counts bytes the
//!   peer has not read yet
//! - [`TcpChannel`] - RDRP frames over a TCP stream

mod memory;
mod tcp;

pub use memory::MemoryChannel;
pub use tcp::TcpChannel;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::Message;

/// An ordered, reliable, message-based channel to one peer.
pub trait Channel: Send + Sync + 'static {
    /// Queue a message for delivery.
    ///
    /// Never blocks on the network; use [`Channel::buffered_amount`] to
    /// apply backpressure.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChannelClosed`] once the channel is closed.
    fn send(&self, message: Message) -> Result<()>;

    /// Bytes queued for sending but not yet flushed.
    fn buffered_amount(&self) -> u64;

    /// Current low-water threshold.
    fn buffered_amount_low_threshold(&self) -> u64;

    /// Set the low-water threshold used by [`Channel::buffered_amount_low`].
    fn set_buffered_amount_low_threshold(&self, threshold: u64);

    /// Resolves once the buffered amount is at or below the low-water
    /// threshold, or the channel closes.
    fn buffered_amount_low(&self) -> impl Future<Output = ()> + Send + '_;

    /// Receive the next inbound message, or `None` once the channel is
    /// closed and drained.
    fn recv(&self) -> impl Future<Output = Option<Message>> + Send + '_;

    /// Close the channel. Idempotent.
    fn close(&self);

    /// Whether the channel still accepts messages.
    fn is_open(&self) -> bool;

    /// Resolves once the channel is closed.
    fn closed(&self) -> impl Future<Output = ()> + Send + '_;
}

/// Buffered-amount bookkeeping shared by channel implementations.
#[derive(Debug, Default)]
pub(crate) struct BufferGauge {
    buffered: AtomicU64,
    threshold: AtomicU64,
    low: Notify,
}

impl BufferGauge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn amount(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }

    pub(crate) fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Acquire)
    }

    pub(crate) fn set_threshold(&self, threshold: u64) {
        self.threshold.store(threshold, Ordering::Release);
        self.low.notify_waiters();
    }

    pub(crate) fn fill(&self, bytes: usize) {
        self.buffered.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    pub(crate) fn drain(&self, bytes: usize) {
        let bytes = bytes as u64;
        let previous = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            })
            .unwrap_or(0);
        if previous.saturating_sub(bytes) <= self.threshold() {
            self.low.notify_waiters();
        }
    }

    fn is_low(&self) -> bool {
        self.amount() <= self.threshold()
    }

    /// Wait until the gauge is at or below its threshold, or `closed` fires.
    pub(crate) async fn wait_low(&self, closed: &CancellationToken) {
        loop {
            let notified = self.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_low() || closed.is_cancelled() {
                return;
            }

            tokio::select! {
                () = notified => {}
                () = closed.cancelled() => return,
            }
        }
    }

    /// Wake every waiter, used when the channel closes.
    pub(crate) fn wake_all(&self) {
        self.low.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_gauge_fill_drain() {
        let gauge = BufferGauge::new();
        gauge.fill(100);
        gauge.fill(50);
        assert_eq!(gauge.amount(), 150);
        gauge.drain(120);
        assert_eq!(gauge.amount(), 30);
        gauge.drain(1000);
        assert_eq!(gauge.amount(), 0);
    }

    #[tokio::test]
    async fn test_wait_low_returns_immediately_when_low() {
        let gauge = BufferGauge::new();
        gauge.set_threshold(10);
        gauge.fill(5);
        let closed = CancellationToken::new();
        tokio::time::timeout(Duration::from_millis(100), gauge.wait_low(&closed))
            .await
            .expect("gauge is already low");
    }

    #[tokio::test]
    async fn test_wait_low_wakes_on_drain() {
        let gauge = Arc::new(BufferGauge::new());
        gauge.set_threshold(10);
        gauge.fill(100);
        let closed = CancellationToken::new();

        let waiter = {
            let gauge = Arc::clone(&gauge);
            let closed = closed.clone();
            tokio::spawn(async move { gauge.wait_low(&closed).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gauge.drain(95);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_low_released_by_close() {
        let gauge = BufferGauge::new();
        gauge.fill(100);
        let closed = CancellationToken::new();
        closed.cancel();
        tokio::time::timeout(Duration::from_millis(100), gauge.wait_low(&closed))
            .await
            .expect("close releases the waiter");
    }
}
