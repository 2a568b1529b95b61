//! nbdlink - exercise an NBD peer over an oldstyle transmission stream.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use nbdlink::{BlockRequest, Config, DeviceRegistry, Session};

#[derive(Parser)]
#[command(
    name = "nbdlink",
    about = "Attach to an NBD peer in the transmission phase and run a probe pass"
)]
struct Cli {
    /// Path to config file. If omitted, uses defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer address. Overrides config file if specified.
    #[arg(short, long)]
    address: Option<String>,

    /// Device unit to attach the stream to.
    #[arg(short, long, default_value_t = 0)]
    unit: usize,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(address) = cli.address {
        config.peer.address = address;
    }

    let registry = DeviceRegistry::from_config(&config);
    let stream = TcpStream::connect(&config.peer.address)
        .await
        .with_context(|| format!("Failed to connect to {}", config.peer.address))?;
    stream.set_nodelay(true)?;
    info!(address = %config.peer.address, "connected");

    let session = registry
        .attach(cli.unit, stream)
        .await
        .with_context(|| format!("Failed to attach device {}", cli.unit))?;

    let run = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.run().await }
    });

    let probed = probe(&session).await;
    if let Err(ref e) = probed {
        error!(error = %e, "probe failed");
        registry.detach(cli.unit).await?;
    }

    let finished = run.await.context("reply loop task failed")?;
    probed?;
    finished.context("reply loop ended with an error")?;
    info!("probe complete");
    Ok(())
}

/// Read, write, flush and trim block 0, then disconnect.
async fn probe(session: &Session<TcpStream>) -> Result<()> {
    let geometry = session.geometry();
    let block_size = geometry.block_size;

    let data = session
        .execute(BlockRequest::read(0, block_size))
        .await
        .context("read of block 0 failed")?
        .into_data()
        .unwrap_or_default();
    info!(
        bytes = data.len(),
        zeroed = data.iter().all(|&b| b == 0),
        "read block 0"
    );

    if geometry.is_read_only() {
        info!("device is read-only, skipping write and trim");
    } else {
        let pattern: Vec<u8> = (0..block_size).map(|i| (i % 251) as u8).collect();
        session
            .execute(BlockRequest::write(0, pattern))
            .await
            .context("write of block 0 failed")?;
        info!(bytes = block_size, "wrote block 0");
    }

    session
        .execute(BlockRequest::Flush)
        .await
        .context("flush failed")?;
    info!("flushed");

    if !geometry.is_read_only() {
        session
            .execute(BlockRequest::trim(0, block_size))
            .await
            .context("trim of block 0 failed")?;
        info!(bytes = block_size, "trimmed block 0");
    }

    session
        .execute(BlockRequest::Disconnect)
        .await
        .context("disconnect failed")?;
    Ok(())
}
