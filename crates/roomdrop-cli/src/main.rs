//! Roomdrop CLI - room-based peer-to-peer file transfer
//!
//! A sender opens a room on a rendezvous server and gets a 6-digit room
//! id; receivers join with the id and the files fan out to all of them.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run a rendezvous server
//! roomdrop serve
//!
//! # Send files
//! roomdrop send ./document.pdf --server 192.168.1.10:7878
//!
//! # Receive files (on another device)
//! roomdrop receive 482913 --server 192.168.1.10:7878
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Receive(args) => commands::receive::run(args).await,
        Command::Config(args) => commands::config::run(args).await,
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,roomdrop=debug,roomdrop_core=debug"
    } else {
        "warn,roomdrop=info,roomdrop_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
