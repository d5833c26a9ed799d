//! Channel over a TCP stream using RDRP frames.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{BufferGauge, Channel};
use crate::error::{Error, Result};
use crate::protocol::{self, Message};

/// Configure TCP keep-alive on a socket.
///
/// Start probing after 10 seconds of idle time and send probes every
/// 5 seconds, so a vanished peer surfaces as a closed channel instead of a
/// transfer stuck waiting on flow control.
pub(crate) fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

/// A [`Channel`] carried over a TCP connection.
///
/// A writer task drains an unbounded queue into the socket; the buffered
/// amount is the number of payload bytes queued but not yet written. A
/// reader task decodes inbound frames. On [`Channel::close`] the writer
/// flushes what is already queued, then shuts the socket down.
#[derive(Debug)]
pub struct TcpChannel {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
    gauge: Arc<BufferGauge>,
    closed: CancellationToken,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TcpChannel {
    /// Connect to a peer and wrap the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream)
    }

    /// Wrap an established stream. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if socket options cannot be applied.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        configure_tcp_keepalive(&stream)?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let gauge = Arc::new(BufferGauge::new());
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(
            write_half,
            out_rx,
            Arc::clone(&gauge),
            closed.clone(),
        ));
        tokio::spawn(read_loop(read_half, in_tx, closed.clone()));

        tracing::debug!("TCP channel open to {}", peer_addr);

        Ok(Self {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            gauge,
            closed,
            local_addr,
            peer_addr,
        })
    }

    /// Local address of the connection.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the remote peer.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Message>,
    gauge: Arc<BufferGauge>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = queue.recv() => message,
            () = closed.cancelled() => queue.try_recv().ok(),
        };
        let Some(message) = message else {
            break;
        };

        let len = message.len();
        let result = protocol::write_message(&mut writer, &message).await;
        gauge.drain(len);
        if let Err(e) = result {
            tracing::warn!("TCP channel write failed: {}", e);
            closed.cancel();
            break;
        }
    }

    while let Ok(message) = queue.try_recv() {
        gauge.drain(message.len());
    }
    gauge.wake_all();
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            result = protocol::read_message(&mut reader) => result,
            () = closed.cancelled() => break,
        };
        match result {
            Ok(Some(message)) => {
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("TCP channel closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!("TCP channel read failed: {}", e);
                break;
            }
        }
    }
    closed.cancel();
}

impl Channel for TcpChannel {
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
            tokio::select! {
                biased;
                message = inbound.recv() => message,
                () = self.closed.cancelled() => inbound.try_recv().ok(),
            }
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("TCP channel to {} closed", self.peer_addr);
        }
        self.closed.cancel();
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + '_ {
        self.closed.cancelled()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
