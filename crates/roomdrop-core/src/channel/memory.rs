//! In-process channel pair.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{BufferGauge, Channel};
use crate::error::{Error, Result};
use crate::protocol::Message;

/// One end of an in-process channel pair.
///
/// The buffered amount of an end counts the bytes it has sent that the
/// other end has not yet received, so a peer that stops calling
/// [`Channel::recv`] stalls its counterpart exactly like a congested data
/// channel. Closing either end closes both; messages already queued can
/// still be drained by the receiving end.
#[derive(Debug)]
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
    /// Bytes this end sent that the peer has not read
    gauge: Arc<BufferGauge>,
    /// The peer's gauge, drained as this end reads
    peer_gauge: Arc<BufferGauge>,
    closed: CancellationToken,
}

impl MemoryChannel {
    /// Create a connected pair of channel ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_gauge = Arc::new(BufferGauge::new());
        let b_gauge = Arc::new(BufferGauge::new());
        let closed = CancellationToken::new();

        let a = Self {
            outbound: a_tx,
            inbound: Mutex::new(a_rx),
            gauge: Arc::clone(&a_gauge),
            peer_gauge: Arc::clone(&b_gauge),
            closed: closed.clone(),
        };
        let b = Self {
            outbound: b_tx,
            inbound: Mutex::new(b_rx),
            gauge: b_gauge,
            peer_gauge: a_gauge,
            closed,
        };
        (a, b)
    }
}

impl Channel for MemoryChannel {
    fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ChannelClosed);
        }
        let len = message.len();
        self.gauge.fill(len);
        self.outbound.send(message).map_err(|_| {
            self.gauge.drain(len);
            Error::ChannelClosed
        })
    }

    fn buffered_amount(&self) -> u64 {
        self.gauge.amount()
    }

    fn buffered_amount_low_threshold(&self) -> u64 {
        self.gauge.threshold()
    }

    fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.gauge.set_threshold(threshold);
    }

    fn buffered_amount_low(&self) -> impl Future<Output = ()> + Send + '_ {
        self.gauge.wait_low(&self.closed)
    }

    fn recv(&self) -> impl Future<Output = Option<Message>> + Send + '_ {
        async move {
            let mut inbound = self.inbound.lock().await;
            let message = tokio::select! {
                biased;
                message = inbound.recv() => message,
                () = self.closed.cancelled() => inbound.try_recv().ok(),
            };
            if let Some(message) = &message {
                self.peer_gauge.drain(message.len());
            }
            message
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("Memory channel closed");
        }
        self.closed.cancel();
        self.gauge.wake_all();
        self.peer_gauge.wake_all();
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + '_ {
        self.closed.cancelled()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}
