//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use roomdrop_core::protocol::ChunkFraming;

/// Load configuration with graceful fallback to defaults.
///
/// This function should be used by all commands to load the user's configuration.
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> roomdrop_core::config::Config {
    match roomdrop_core::config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Using default configuration: {}", e);
            roomdrop_core::config::Config::default()
        }
    }
}

pub mod config;
pub mod receive;
pub mod send;
pub mod serve;

/// Connection setup a sender relays to each receiver.
///
/// The directory passes it through untouched; only the two peers read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupOffer {
    /// Address of the sender's data listener
    pub addr: String,
    /// Chunk framing the sender uses
    pub framing: ChunkFraming,
    /// Ack batch the receiver must use, if the sender waits for acks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_batch: Option<u64>,
}

/// Roomdrop - room-based peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "roomdrop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Run a rendezvous server
    Serve(ServeArgs),

    /// Open a room and send files to everyone who joins
    Send(SendArgs),

    /// Join a room and receive its files
    Receive(ReceiveArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser)]
pub struct ServeArgs {
    /// Address to listen on (defaults to the configured bind address)
    #[arg(short, long)]
    pub bind: Option<String>,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Files and folders to send
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Rendezvous server address
    #[arg(short, long, env = "ROOMDROP_SERVER")]
    pub server: Option<String>,

    /// Number of receivers to wait for before sending
    #[arg(short = 'n', long, default_value_t = 1)]
    pub receivers: usize,

    /// Use acknowledgment windows instead of buffered-amount gating
    #[arg(long)]
    pub windowed: bool,

    /// Keep this many files in flight per receiver (tags chunks)
    #[arg(long)]
    pub pipeline: Option<usize>,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Give up on a receiver that stalls this long (e.g. 30s, 2m)
    #[arg(long)]
    pub flow_timeout: Option<String>,

    /// Address receivers should connect to (defaults to the interface that
    /// reaches the server)
    #[arg(long)]
    pub advertise: Option<String>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output the per-receiver outcome in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the receive command
#[derive(Parser)]
pub struct ReceiveArgs {
    /// Room id to join
    pub room: String,

    /// Rendezvous server address
    #[arg(short, long, env = "ROOMDROP_SERVER")]
    pub server: Option<String>,

    /// Output directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write the default configuration to the configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
