//! Flow control strategies.
//!
//! Both strategies only ever delay a send; neither drops nor skips one.
//! Every wait is bounded by the transfer's cancellation token and, when
//! configured, a timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::error::{Error, Result};

/// Run a flow-control wait, aborting on cancellation or timeout.
pub(crate) async fn bounded_wait<F>(
    wait: F,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let wait = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::FlowControlTimeout(limit))?,
            None => wait.await,
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::TransferCancelled),
        result = wait => result,
    }
}

/// Wait until `channel` may take another chunk under threshold gating.
///
/// Returns immediately while the buffered amount is at or below
/// `high_water`. Otherwise suspends until the channel reports its buffered
/// amount has fallen to the low-water threshold configured on it.
pub(crate) async fn wait_for_buffer<C: Channel>(
    channel: &C,
    high_water: u64,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::TransferCancelled);
    }
    if !channel.is_open() {
        return Err(Error::ChannelClosedMidTransfer);
    }
    if channel.buffered_amount() <= high_water {
        return Ok(());
    }

    tracing::trace!(
        "Buffered amount {} above high water {}, suspending",
        channel.buffered_amount(),
        high_water
    );

    bounded_wait(
        async {
            channel.buffered_amount_low().await;
            if channel.is_open() {
                Ok(())
            } else {
                Err(Error::ChannelClosedMidTransfer)
            }
        },
        timeout,
        cancel,
    )
    .await
}

#[derive(Debug, Default)]
struct FileWindow {
    sent: u64,
    acked: u64,
    /// No more chunks will be sent
    finished: bool,
}

#[derive(Debug, Default)]
struct WindowState {
    files: HashMap<Option<String>, FileWindow>,
    outstanding: u64,
    closed: bool,
}

/// Sender-side acknowledgment window for one destination.
///
/// Counts chunks sent and acknowledged per file. Acks are cumulative: an
/// ack `{fileId, throughSeq: n}` covers chunks `0..=n` of that file.
#[derive(Debug, Default)]
pub struct AckWindow {
    state: Mutex<WindowState>,
    changed: Notify,
}

impl AckWindow {
    /// Create an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Chunks sent but not yet acknowledged, across all files.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.lock().outstanding
    }

    /// Record that one more chunk of `file_id` was sent.
    pub fn on_sent(&self, file_id: Option<&str>) {
        let mut state = self.lock();
        state
            .files
            .entry(file_id.map(str::to_string))
            .or_default()
            .sent += 1;
        state.outstanding += 1;
    }

    /// Apply a cumulative ack for `file_id` through `through_seq`.
    ///
    /// Acks for unknown files, stale acks and acks beyond what was sent are
    /// clamped; they never make the outstanding count negative.
    pub fn on_ack(&self, file_id: Option<&str>, through_seq: u64) {
        let mut state = self.lock();
        let key = file_id.map(str::to_string);
        let Some(file) = state.files.get_mut(&key) else {
            tracing::debug!("Ack for unknown file {:?} ignored", file_id);
            return;
        };

        let acked = through_seq.saturating_add(1).min(file.sent);
        if acked <= file.acked {
            return;
        }
        let newly = acked - file.acked;
        file.acked = acked;
        let settled = file.finished && file.acked == file.sent;
        state.outstanding -= newly;
        if settled {
            state.files.remove(&key);
        }
        drop(state);

        self.changed.notify_waiters();
    }

    /// Record that `file_id` will send no more chunks.
    ///
    /// Its bookkeeping is dropped as soon as every chunk is acknowledged,
    /// so a long run of tagged files does not accumulate entries.
    pub fn on_finished(&self, file_id: Option<&str>) {
        let mut state = self.lock();
        let key = file_id.map(str::to_string);
        let Some(file) = state.files.get_mut(&key) else {
            return;
        };
        file.finished = true;
        if file.acked == file.sent {
            state.files.remove(&key);
        }
    }

    /// Files with chunks still tracked.
    #[must_use]
    pub fn tracked_files(&self) -> usize {
        self.lock().files.len()
    }

    /// Drop the bookkeeping for a fully acknowledged file.
    ///
    /// Used between untagged files, whose acks all share the implicit id.
    pub fn forget(&self, file_id: Option<&str>) {
        let mut state = self.lock();
        let key = file_id.map(str::to_string);
        if let Some(file) = state.files.remove(&key) {
            state.outstanding -= file.sent - file.acked;
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Mark the destination gone; every waiter fails.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Wait until the outstanding count satisfies `ready`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosedMidTransfer`] once the window is closed.
    pub async fn wait_until(&self, ready: impl Fn(u64) -> bool) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if state.closed {
                    return Err(Error::ChannelClosedMidTransfer);
                }
                if ready(state.outstanding) {
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Wait for room to send one more chunk under a window of `window`.
    pub(crate) async fn wait_for_slot(
        &self,
        window: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::TransferCancelled);
        }
        bounded_wait(self.wait_until(|outstanding| outstanding < window), timeout, cancel).await
    }

    /// Wait until every chunk sent so far is acknowledged.
    pub(crate) async fn wait_drained(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        bounded_wait(self.wait_until(|outstanding| outstanding == 0), timeout, cancel).await
    }
}
