//! Control plane: rendezvous messages, server and client.
//!
//! Control messages are JSON objects tagged by `"type"`, one per text
//! frame of the RDRP frame format. Only the [`Directory`] interprets them;
//! relay payloads pass through untouched.
//!
//! [`Directory`]: crate::directory::Directory

mod client;
mod message;
mod server;

pub use client::SignalingClient;
pub use message::{ClientMessage, ServerMessage};
pub use server::{ServerHandle, SignalingServer};
