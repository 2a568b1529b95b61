//! conformance_peer - reference NBD responder for exercising clients.
//!
//! Speaks only the transmission phase: a client connects and starts sending
//! requests immediately.

use std::ops::Range;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use nbdlink_dst::{ConformancePeer, PeerOptions};

#[derive(Parser)]
#[command(
    name = "conformance_peer",
    about = "NBD responder that zero-fills reads and discards writes"
)]
struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:10809")]
    listen: String,

    /// Shuffle replies with this seed instead of answering in order.
    #[arg(long)]
    reorder_seed: Option<u64>,

    /// Byte offset where the range failing with EIO starts.
    #[arg(long, requires = "poison_len")]
    poison_start: Option<u64>,

    /// Length of the range failing with EIO.
    #[arg(long, requires = "poison_start")]
    poison_len: Option<u64>,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

impl Cli {
    fn poisoned(&self) -> Option<Range<u64>> {
        let start = self.poison_start?;
        Some(start..start.saturating_add(self.poison_len?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let peer = ConformancePeer::with_options(PeerOptions {
        reorder_seed: cli.reorder_seed,
        poisoned: cli.poisoned(),
    });

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!(address = %cli.listen, "listening");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = accepted.context("accept failed")?;
                stream.set_nodelay(true)?;
                info!(%addr, "client connected");

                let peer = peer.clone();
                tokio::spawn(async move {
                    match peer.serve(stream).await {
                        Ok(stats) => info!(%addr, ?stats, "client finished"),
                        Err(e) => error!(%addr, error = %e, "connection failed"),
                    }
                });
            }
        }
    }
}
