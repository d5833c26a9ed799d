//! Receive command implementation.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use roomdrop_core::channel::TcpChannel;
use roomdrop_core::room::RoomId;
use roomdrop_core::signaling::{ServerMessage, SignalingClient};
use roomdrop_core::transfer::{receive_loop, Decoder, DecoderEvent};
use roomdrop_core::Error;

use super::{ReceiveArgs, SetupOffer};
use crate::ui::format_size;

/// Run the receive command.
pub async fn run(args: ReceiveArgs) -> Result<()> {
    let global_config = super::load_config();

    let room = RoomId::parse(args.room.trim()).context("Room ids are 6 digits")?;
    let output_dir = args.output.clone().unwrap_or_else(|| PathBuf::from("."));

    let server = args
        .server
        .clone()
        .unwrap_or_else(|| global_config.server.url.clone());
    let mut client = SignalingClient::connect(server.as_str())
        .await
        .with_context(|| format!("Cannot reach rendezvous server at {server}"))?;

    match client.join_room(&room).await {
        Ok(()) => {}
        Err(e @ Error::RoomNotFound(_)) => {
            eprintln!("  No sender found for room {}.", room);
            if let Some(hint) = e.suggestion() {
                eprintln!("  {}", hint);
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }

    if !args.quiet {
        println!();
        println!("  Joined room {}, waiting for the sender...", room);
    }

    let offer = loop {
        tokio::select! {
            message = client.recv() => match message {
                Some(ServerMessage::RelaySetup { payload, from }) => {
                    match serde_json::from_value::<SetupOffer>(payload) {
                        Ok(offer) => break offer,
                        Err(e) => tracing::warn!("Unusable setup from {}: {}", from, e),
                    }
                }
                Some(ServerMessage::SenderLeft) => bail!("The sender left the room"),
                Some(other) => tracing::debug!("Ignoring {}", other.type_name()),
                None => bail!("Rendezvous server closed the connection"),
            },
            _ = tokio::signal::ctrl_c() => {
                client.close();
                return Ok(());
            }
        }
    };

    tracing::debug!("Connecting to sender at {}", offer.addr);
    let channel = TcpChannel::connect(offer.addr.as_str())
        .await
        .with_context(|| format!("Cannot connect to the sender at {}", offer.addr))?;

    let decoder = Decoder::new(offer.framing, offer.ack_batch);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let receiver = tokio::spawn(async move { receive_loop(&channel, decoder, events_tx).await });

    let mut saved = 0usize;
    let mut failed = 0usize;
    let mut received_bytes = 0u64;

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    DecoderEvent::Started { meta, .. } => {
                        if !args.quiet {
                            println!("  Receiving {} ({})", meta.filename, format_size(meta.size));
                        }
                    }
                    DecoderEvent::Progress { received, size, .. } => {
                        if !args.quiet && size > 0 {
                            print!("\r  [{:>6.2}%]    ", received as f64 / size as f64 * 100.0);
                            let _ = io::stdout().flush();
                        }
                    }
                    DecoderEvent::Completed(file) => {
                        let path = file.save_to(&output_dir).await?;
                        saved += 1;
                        received_bytes += file.data.len() as u64;
                        if !args.quiet {
                            println!("\r  Saved {}", path.display());
                        }
                    }
                    DecoderEvent::Failed { file_id, error } => {
                        failed += 1;
                        eprintln!("\r  File {} failed: {}", file_id.as_deref().unwrap_or("-"), error);
                    }
                    DecoderEvent::SendAck(_) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                receiver.abort();
                break;
            }
        }
    }

    if let Ok(result) = receiver.await {
        result?;
    }
    client.close();

    if !args.quiet {
        println!();
        println!(
            "  Received {} file(s) ({}) into {}",
            saved,
            format_size(received_bytes),
            output_dir.display()
        );
        println!();
    }

    if failed > 0 {
        bail!("{} file(s) could not be received", failed);
    }
    Ok(())
}
