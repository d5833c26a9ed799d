//! Common test utilities for `Roomdrop` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use roomdrop_core::channel::{Channel, MemoryChannel};
use roomdrop_core::protocol::Message;
use roomdrop_core::transfer::{receive_loop, Decoder, DecoderEvent, ReceivedFile};

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create `count` connected pairs, returning the sender ends (shared, ready
/// for an encoder) and the receiver ends.
pub fn channel_pairs(count: usize) -> (Vec<Arc<MemoryChannel>>, Vec<Arc<MemoryChannel>>) {
    (0..count)
        .map(|_| {
            let (local, remote) = MemoryChannel::pair();
            (Arc::new(local), Arc::new(remote))
        })
        .unzip()
}

/// Run a receive loop on `channel` in the background and collect every
/// completed file.
pub fn spawn_receiver<C: Channel>(
    channel: Arc<C>,
    decoder: Decoder,
) -> JoinHandle<Vec<ReceivedFile>> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let loop_handle = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { receive_loop(channel.as_ref(), decoder, tx).await })
        };

        let mut files = Vec::new();
        while let Some(event) = rx.recv().await {
            if let DecoderEvent::Completed(file) = event {
                files.push(file);
            }
        }
        loop_handle
            .await
            .expect("receive loop panicked")
            .expect("receive loop failed");
        files
    })
}

/// Await a future with a generous deadline so a hung test fails instead of
/// blocking the suite.
pub async fn within<F: Future>(secs: u64, future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), future)
        .await
        .expect("timed out")
}

/// A channel that records the largest buffered amount it ever reached right
/// after a send, and the largest chunk it carried.
#[derive(Debug)]
pub struct ProbeChannel {
    inner: MemoryChannel,
    peak_buffered: AtomicU64,
    largest_binary: AtomicU64,
}

impl ProbeChannel {
    /// Wrap one end of a channel pair.
    pub fn new(inner: MemoryChannel) -> Self {
        Self {
            inner,
            peak_buffered: AtomicU64::new(0),
            largest_binary: AtomicU64::new(0),
        }
    }

    /// Largest buffered amount observed just after a binary send.
    pub fn peak_buffered(&self) -> u64 {
        self.peak_buffered.load(Ordering::SeqCst)
    }

    /// Largest binary message sent.
    pub fn largest_binary(&self) -> u64 {
        self.largest_binary.load(Ordering::SeqCst)
    }
}

impl Channel for ProbeChannel {
    fn send(&self, message: Message) -> roomdrop_core::Result<()> {
        let binary = match &message {
            Message::Binary(data) => Some(data.len() as u64),
            Message::Text(_) => None,
        };
        self.inner.send(message)?;
        if let Some(len) = binary {
            self.largest_binary.fetch_max(len, Ordering::SeqCst);
            self.peak_buffered
                .fetch_max(self.inner.buffered_amount(), Ordering::SeqCst);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> u64 {
        self.inner.buffered_amount()
    }

    fn buffered_amount_low_threshold(&self) -> u64 {
        self.inner.buffered_amount_low_threshold()
    }

    fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.inner.set_buffered_amount_low_threshold(threshold);
    }

    fn buffered_amount_low(&self) -> impl Future<Output = ()> + Send + '_ {
        self.inner.buffered_amount_low()
    }

    fn recv(&self) -> impl Future<Output = Option<Message>> + Send + '_ {
        self.inner.recv()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + '_ {
        self.inner.closed()
    }
}
