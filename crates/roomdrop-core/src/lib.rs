//! # Roomdrop Core Library
//!
//! `roomdrop-core` provides the core functionality for Roomdrop, a
//! room-based peer-to-peer file transfer tool.
//!
//! ## Features
//!
//! - **Room-based rendezvous**: one sender, any number of receivers, a
//!   6-digit room id
//! - **Chunked transfers**: header / chunk / done framing over any ordered,
//!   reliable message channel
//! - **Flow control**: buffered-amount gating or acknowledgment windows
//! - **Fan-out**: every receiver is paced independently
//!
//! ## Modules
//!
//! - [`channel`] - Peer transport abstraction (in-memory and TCP)
//! - [`config`] - Configuration management
//! - [`directory`] - Rendezvous directory (rooms, membership, relay)
//! - [`error`] - Error types
//! - [`protocol`] - RDRP frame format and transfer-plane messages
//! - [`room`] - Room id generation and validation
//! - [`signaling`] - Control-plane messages, server and client
//! - [`transfer`] - Transfer encoder, decoder and flow control
//!
//! ## Example
//!
//! ```rust,ignore
//! use roomdrop_core::channel::MemoryChannel;
//! use roomdrop_core::transfer::{Decoder, Encoder, FileSource, TransferConfig};
//!
//! let (local, remote) = MemoryChannel::pair();
//! let encoder = Encoder::new(TransferConfig::default());
//! let report = encoder
//!     .send_file(FileSource::from_bytes("a.bin", data), vec![local.into()], cancel)
//!     .await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod channel;
pub mod config;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod room;
pub mod signaling;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for RDRP
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default rendezvous server port (TCP)
pub const DEFAULT_SERVER_PORT: u16 = 7878;

/// Default chunk size for file transfers (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default high-water mark for threshold flow control (1 MB)
pub const DEFAULT_HIGH_WATER: u64 = 1024 * 1024;

/// Default low-water threshold for threshold flow control (256 KB)
pub const DEFAULT_LOW_WATER: u64 = 256 * 1024;

/// Default window, in chunks, for acknowledgment flow control
pub const DEFAULT_WINDOW: u64 = 16;

/// Default number of chunks a receiver consumes between acks
pub const DEFAULT_ACK_BATCH: u64 = 4;
