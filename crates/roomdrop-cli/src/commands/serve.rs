//! Serve command implementation.

use anyhow::{Context, Result};

use roomdrop_core::signaling::SignalingServer;

use super::ServeArgs;

/// Run the serve command.
pub async fn run(args: ServeArgs) -> Result<()> {
    let global_config = super::load_config();
    let bind = args.bind.unwrap_or(global_config.server.bind);

    let server = SignalingServer::bind(bind.as_str())
        .await
        .with_context(|| format!("Cannot listen on {bind}"))?;
    let addr = server.local_addr()?;

    println!();
    println!("Roomdrop v{}", roomdrop_core::VERSION);
    println!("{}", "-".repeat(37));
    println!();
    println!("  Rendezvous server listening on {}", addr);
    println!("  Press Ctrl-C to stop.");
    println!();

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    server.run().await?;
    println!("  Stopped.");
    Ok(())
}
