//! Send command implementation.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use roomdrop_core::channel::{Channel, TcpChannel};
use roomdrop_core::signaling::{ServerMessage, SignalingClient};
use roomdrop_core::transfer::{
    DestinationOutcome, Encoder, FileSource, FlowStrategy, TransferConfig, TransferProgress,
    TransferReport, TransferState,
};

use super::{SendArgs, SetupOffer};
use crate::ui::{format_size, parse_duration, RoomBox};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let global_config = super::load_config();
    global_config.validate()?;
    if args.receivers == 0 {
        bail!("At least one receiver is required");
    }

    let config = build_config(&args, &global_config)?;
    config.validate()?;

    let files = FileSource::collect(&args.paths).await?;
    if files.is_empty() {
        bail!("Nothing to send: no regular files under the given paths");
    }
    let total_size: u64 = files.iter().map(FileSource::size).sum();

    let server = args
        .server
        .clone()
        .unwrap_or_else(|| global_config.server.url.clone());
    let mut client = SignalingClient::connect(server.as_str())
        .await
        .with_context(|| format!("Cannot reach rendezvous server at {server}"))?;
    let room = client.create_room().await?;

    let listener = TcpListener::bind(SocketAddr::new(client.local_addr().ip(), 0)).await?;
    let advertised = match &args.advertise {
        Some(addr) => addr.clone(),
        None => listener.local_addr()?.to_string(),
    };
    let offer = SetupOffer {
        addr: advertised,
        framing: config.framing,
        ack_batch: config.ack_batch(),
    };

    if !args.quiet {
        println!();
        println!("Roomdrop v{}", roomdrop_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!(
            "  Sending {} file(s) ({})",
            files.len(),
            format_size(total_size)
        );
        println!();
        for file in &files {
            println!("  {} ({})", file.meta().filename, format_size(file.size()));
        }
        println!();
        RoomBox::new(room.as_str())
            .with_receivers(args.receivers)
            .display();
        println!();
    }

    let Some(destinations) = gather_receivers(&mut client, &listener, &offer, &args).await? else {
        client.close();
        println!("  Cancelled.");
        return Ok(());
    };
    drop(listener);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let encoder = Encoder::new(config);
    let progress = (!args.quiet && !args.json)
        .then(|| tokio::spawn(display_progress(encoder.progress())));

    let report = encoder
        .send_files(files, destinations.clone(), cancel)
        .await;

    ctrl_c.abort();
    for channel in &destinations {
        flush_and_close(channel).await;
    }
    if let Some(handle) = progress {
        let _ = handle.await;
    }
    client.close();

    print_report(&report, &args)?;

    if report.failed_count() > 0 {
        bail!(
            "{} of {} receiver(s) did not get the files",
            report.failed_count(),
            report.outcomes.len()
        );
    }
    Ok(())
}

fn build_config(
    args: &SendArgs,
    global_config: &roomdrop_core::config::Config,
) -> Result<TransferConfig> {
    let mut config = global_config.transfer_config();

    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if args.windowed {
        config.flow = FlowStrategy::Windowed {
            window: global_config.flow.window,
            ack_batch: global_config.flow.ack_batch,
        };
    }
    if let Some(files) = args.pipeline {
        config = config.pipelined(files);
    }
    if let Some(timeout) = &args.flow_timeout {
        let Some(timeout) = parse_duration(timeout) else {
            bail!("Invalid flow timeout '{timeout}', expected e.g. 30s, 2m or 1h");
        };
        config.flow_timeout = Some(timeout);
    }

    Ok(config)
}

/// Relay the offer to each joining receiver and accept their data
/// connections until enough are in. `None` if interrupted.
async fn gather_receivers(
    client: &mut SignalingClient,
    listener: &TcpListener,
    offer: &SetupOffer,
    args: &SendArgs,
) -> Result<Option<Vec<Arc<TcpChannel>>>> {
    let payload = serde_json::to_value(offer)?;
    let mut destinations = Vec::with_capacity(args.receivers);

    if !args.quiet {
        println!("  Waiting for {} receiver(s)...", args.receivers);
    }

    while destinations.len() < args.receivers {
        tokio::select! {
            message = client.recv() => match message {
                Some(ServerMessage::Init { peer_id }) => {
                    tracing::debug!("Offering {} to {}", offer.addr, peer_id);
                    client.relay(&peer_id, payload.clone())?;
                }
                Some(ServerMessage::MembershipChanged { count }) => {
                    tracing::info!("{} receiver(s) in the room", count);
                }
                Some(ServerMessage::PeerLeft { peer_id }) => {
                    tracing::info!("Receiver {} left", peer_id);
                }
                Some(ServerMessage::Error { message }) => {
                    tracing::warn!("Server error: {}", message);
                }
                Some(other) => tracing::debug!("Ignoring {}", other.type_name()),
                None => bail!("Rendezvous server closed the connection"),
            },
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let channel = TcpChannel::from_stream(stream)?;
                destinations.push(Arc::new(channel));
                if !args.quiet {
                    println!(
                        "  Receiver {} connected from {}",
                        destinations.len(),
                        addr
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(None),
        }
    }

    Ok(Some(destinations))
}

/// Wait for queued chunks to reach the socket, then close.
async fn flush_and_close(channel: &TcpChannel) {
    channel.set_buffered_amount_low_threshold(0);
    if tokio::time::timeout(FLUSH_TIMEOUT, channel.buffered_amount_low())
        .await
        .is_err()
    {
        tracing::warn!(
            "Receiver at {} still has {} bytes queued, closing anyway",
            channel.peer_addr(),
            channel.buffered_amount()
        );
    }
    channel.close();
}

async fn display_progress(mut rx: watch::Receiver<Vec<TransferProgress>>) {
    loop {
        let changed = tokio::time::timeout(Duration::from_millis(250), rx.changed()).await;
        let all = rx.borrow().clone();

        let finished = all.iter().all(|p| {
            matches!(
                p.state,
                TransferState::Completed | TransferState::Cancelled | TransferState::Failed
            )
        });

        let line = all
            .iter()
            .enumerate()
            .map(|(i, p)| format!("#{} {:>5.1}%", i + 1, p.percentage()))
            .collect::<Vec<_>>()
            .join("  ");
        let speed = all.iter().map(TransferProgress::speed_bps).max().unwrap_or(0);
        print!("\r  {}  {}/s    ", line, format_size(speed));
        let _ = io::stdout().flush();

        if finished && !all.is_empty() {
            break;
        }
        if matches!(changed, Ok(Err(_))) {
            break;
        }
    }
    println!();
}

fn print_report(report: &TransferReport, args: &SendArgs) -> Result<()> {
    if args.json {
        let output = serde_json::json!({
            "succeeded": report.succeeded_count(),
            "failed": report.failed_count(),
            "cancelled": report.cancelled_count(),
            "receivers": report.outcomes.iter().map(|outcome| match outcome {
                DestinationOutcome::Succeeded { files, bytes } => serde_json::json!({
                    "outcome": "succeeded", "files": files, "bytes": bytes,
                }),
                DestinationOutcome::Failed { reason } => serde_json::json!({
                    "outcome": "failed",
                    "reason": reason.to_string(),
                    "code": reason.code(),
                }),
                DestinationOutcome::Cancelled => serde_json::json!({ "outcome": "cancelled" }),
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if args.quiet {
        return Ok(());
    }

    println!();
    for (index, outcome) in report.outcomes.iter().enumerate() {
        println!("  Receiver {}: {}", index + 1, outcome);
        if let DestinationOutcome::Failed { reason } = outcome {
            if let Some(hint) = reason.suggestion() {
                println!("    {}", hint);
            }
        }
    }
    println!();
    println!(
        "  {} succeeded, {} failed, {} cancelled",
        report.succeeded_count(),
        report.failed_count(),
        report.cancelled_count()
    );
    println!();
    Ok(())
}
