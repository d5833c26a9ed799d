//! Transfer engine for Roomdrop.
//!
//! This module moves files from one sender to any number of receivers over
//! [`Channel`](crate::channel::Channel)s:
//!
//! - [`Encoder`] - sender side: header, fixed-size chunks, done, paced by
//!   a flow-control strategy, one task per destination
//! - [`Decoder`] - receiver side: reassembly state machine with a pending
//!   buffer for chunks that overtake their header
//! - [`flow`] - threshold gate and acknowledgment window
//!
//! ## Wire Sequence
//!
//! ```text
//! Sender                                   Receiver
//!    │                                        │
//!    │─────── header {fileId?, meta} ────────►│
//!    │─────── chunk 0 ───────────────────────►│
//!    │─────── chunk 1 ───────────────────────►│
//!    │◄────── ack {throughSeq: 1} ────────────│  (windowed only)
//!    │─────── ... ───────────────────────────►│
//!    │─────── done {fileId?} ────────────────►│
//!    │◄────── ack {throughSeq: n} ────────────│  (windowed only)
//! ```
//!
//! Chunk sequence numbers are implicit: the 0-based ordinal of a chunk
//! within its file, as delivered by the ordered channel.

pub mod decoder;
pub mod encoder;
pub mod flow;
pub mod source;

pub use decoder::{receive_loop, Decoder, DecoderEvent, ReceivedFile};
pub use encoder::Encoder;
pub use flow::AckWindow;
pub use source::FileSource;

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::protocol::{ChunkFraming, MAX_FILE_ID_LEN, MAX_PAYLOAD_SIZE};

/// How chunk emission is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStrategy {
    /// Suspend while the channel's buffered amount exceeds `high_water`,
    /// resume once it drains to `low_water`.
    Threshold {
        /// Buffered bytes above which sending suspends
        high_water: u64,
        /// Buffered bytes at which sending resumes
        low_water: u64,
    },
    /// Keep at most `window` chunks unacknowledged; receivers ack every
    /// `ack_batch` chunks.
    Windowed {
        /// Unacknowledged chunks allowed in flight
        window: u64,
        /// Chunks a receiver consumes between acks
        ack_batch: u64,
    },
}

impl Default for FlowStrategy {
    fn default() -> Self {
        Self::Threshold {
            high_water: crate::DEFAULT_HIGH_WATER,
            low_water: crate::DEFAULT_LOW_WATER,
        }
    }
}

/// Configuration for a transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Binary chunk framing
    pub framing: ChunkFraming,
    /// Files a destination keeps open at once
    pub max_inflight_files: usize,
    /// Flow control strategy
    pub flow: FlowStrategy,
    /// Bound on any single flow-control wait; `None` waits until cancelled
    pub flow_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            framing: ChunkFraming::Untagged,
            max_inflight_files: 1,
            flow: FlowStrategy::default(),
            flow_timeout: None,
        }
    }
}

impl TransferConfig {
    /// Switch to windowed flow control with the given parameters.
    #[must_use]
    pub fn windowed(mut self, window: u64, ack_batch: u64) -> Self {
        self.flow = FlowStrategy::Windowed { window, ack_batch };
        self
    }

    /// Keep up to `files` files open per destination, tagging chunks.
    #[must_use]
    pub fn pipelined(mut self, files: usize) -> Self {
        self.max_inflight_files = files;
        self.framing = ChunkFraming::Tagged;
        self
    }

    /// Ack batch size receivers should use, if the strategy needs acks.
    #[must_use]
    pub fn ack_batch(&self) -> Option<u64> {
        match self.flow {
            FlowStrategy::Threshold { .. } => None,
            FlowStrategy::Windowed { ack_batch, .. } => Some(ack_batch),
        }
    }

    /// Check that the settings can work together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        let overhead = match self.framing {
            ChunkFraming::Untagged => 0,
            ChunkFraming::Tagged => 1 + MAX_FILE_ID_LEN,
        };
        if self.chunk_size == 0 || self.chunk_size + overhead > MAX_PAYLOAD_SIZE {
            return Err(invalid(
                "transfer.chunk_size",
                format!("must be between 1 and {}", MAX_PAYLOAD_SIZE - overhead),
            ));
        }

        if self.max_inflight_files == 0 {
            return Err(invalid("transfer.max_inflight_files", "must be at least 1"));
        }
        if self.max_inflight_files > 1 && self.framing == ChunkFraming::Untagged {
            return Err(invalid(
                "transfer.max_inflight_files",
                "pipelining more than one file requires tagged framing",
            ));
        }

        match self.flow {
            FlowStrategy::Threshold {
                high_water,
                low_water,
            } => {
                if low_water > high_water {
                    return Err(invalid(
                        "flow.low_water",
                        format!("must not exceed high_water ({high_water})"),
                    ));
                }
            }
            FlowStrategy::Windowed { window, ack_batch } => {
                if window == 0 {
                    return Err(invalid("flow.window", "must be at least 1"));
                }
                if ack_batch == 0 || ack_batch > window {
                    return Err(invalid(
                        "flow.ack_batch",
                        format!("must be between 1 and the window ({window})"),
                    ));
                }
            }
        }

        if self.flow_timeout == Some(Duration::ZERO) {
            return Err(invalid("flow.timeout", "must be greater than zero"));
        }

        Ok(())
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Transfer state for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Not started yet
    Preparing,
    /// Sending files
    Transferring,
    /// Waiting for the final acknowledgments
    Draining,
    /// All files sent (and acknowledged, under windowed control)
    Completed,
    /// Transfer was cancelled
    Cancelled,
    /// Transfer failed
    Failed,
}

/// Progress information for one destination.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Current state
    pub state: TransferState,
    /// Files fully sent
    pub files_done: usize,
    /// Total number of files
    pub total_files: usize,
    /// Name of the file most recently sent a chunk
    pub current_file_name: String,
    /// Chunk bytes sent across all files
    pub bytes_sent: u64,
    /// Total bytes across all files
    pub total_bytes: u64,
    /// When the transfer started
    pub started_at: Instant,
}

impl TransferProgress {
    /// Create a new progress tracker.
    #[must_use]
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        Self {
            state: TransferState::Preparing,
            files_done: 0,
            total_files,
            current_file_name: String::new(),
            bytes_sent: 0,
            total_bytes,
            started_at: Instant::now(),
        }
    }

    /// Get overall progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_sent as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Average send rate so far, in bytes per second.
    #[must_use]
    pub fn speed_bps(&self) -> u64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            (self.bytes_sent as f64 / elapsed) as u64
        }
    }
}

/// Result of a transfer for one destination.
#[derive(Debug)]
pub enum DestinationOutcome {
    /// Every file was sent (and acknowledged, under windowed control)
    Succeeded {
        /// Files delivered
        files: usize,
        /// Chunk bytes delivered
        bytes: u64,
    },
    /// The destination was dropped
    Failed {
        /// Why it was dropped
        reason: Error,
    },
    /// The transfer was cancelled before this destination finished
    Cancelled,
}

impl DestinationOutcome {
    /// Returns true for [`DestinationOutcome::Succeeded`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

impl std::fmt::Display for DestinationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded { files, bytes } => write!(f, "sent {files} file(s), {bytes} bytes"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-destination outcomes of a send, in destination order.
#[derive(Debug, Default)]
pub struct TransferReport {
    /// One outcome per destination
    pub outcomes: Vec<DestinationOutcome>,
}

impl TransferReport {
    /// Number of destinations that received everything.
    #[must_use]
    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Number of destinations dropped with an error.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DestinationOutcome::Failed { .. }))
            .count()
    }

    /// Number of destinations stopped by cancellation.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DestinationOutcome::Cancelled))
            .count()
    }

    /// Returns true when every destination succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(DestinationOutcome::is_success)
    }
}
