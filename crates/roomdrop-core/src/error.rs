//! Error types for Roomdrop.
//!
//! This module provides a unified error type for all Roomdrop operations,
//! with specific error variants for directory, transfer and transport
//! failure modes.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A specialized `Result` type for Roomdrop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Roomdrop.
#[derive(Error, Debug)]
pub enum Error {
    /// No sender is registered for the room (E001)
    #[error("no sender for room '{0}'")]
    RoomNotFound(String),

    /// Header received for a file that is already open (E002)
    #[error("duplicate header for file '{file_id}'")]
    DuplicateHeader {
        /// The file whose header was repeated
        file_id: String,
    },

    /// Received byte count disagrees with the declared size (E003)
    #[error("size mismatch for file '{file_id}': expected {expected} bytes, received {received}")]
    SizeMismatch {
        /// The file being reassembled
        file_id: String,
        /// Size declared in the header
        expected: u64,
        /// Bytes actually received
        received: u64,
    },

    /// Destination channel closed while a transfer was in flight (E004)
    #[error("channel closed mid-transfer")]
    ChannelClosedMidTransfer,

    /// Flow control waited longer than the configured bound (E005)
    #[error("flow control timed out after {0:?}")]
    FlowControlTimeout(Duration),

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// Send attempted on a closed channel
    #[error("channel is closed")]
    ChannelClosed,

    /// Invalid room id format
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),

    /// Room id generation could not find a free id
    #[error("room id collision, unable to generate unique id")]
    RoomIdCollision,

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Unexpected message type
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type
        expected: String,
        /// Actual message type received
        actual: String,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::RoomNotFound(_) => Some("E001"),
            Self::DuplicateHeader { .. } => Some("E002"),
            Self::SizeMismatch { .. } => Some("E003"),
            Self::ChannelClosedMidTransfer => Some("E004"),
            Self::FlowControlTimeout(_) => Some("E005"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RoomNotFound(_)
                | Self::ChannelClosedMidTransfer
                | Self::FlowControlTimeout(_)
                | Self::Timeout(_)
        )
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::RoomNotFound(_) => Some(
                "Check the room id with the sender. Rooms disappear as soon as\n\
                 the sender disconnects.",
            ),
            Self::FlowControlTimeout(_) => Some(
                "The receiver stopped draining data. Raise [flow] timeout in the\n\
                 config or check the receiver's connection.",
            ),
            Self::InvalidConfig { .. } => Some("Run 'roomdrop config show' to inspect the config."),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::RoomNotFound("123456".into()).code(), Some("E001"));
        assert_eq!(
            Error::SizeMismatch {
                file_id: "a".into(),
                expected: 1,
                received: 2
            }
            .code(),
            Some("E003")
        );
        assert_eq!(Error::TransferCancelled.code(), None);
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::ChannelClosedMidTransfer.is_recoverable());
        assert!(Error::FlowControlTimeout(Duration::from_secs(1)).is_recoverable());
        assert!(!Error::DuplicateHeader {
            file_id: "a".into()
        }
        .is_recoverable());
    }
}
