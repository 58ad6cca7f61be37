mod relay;
mod tcp_proxy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use deaddrop_core::config::{FolderArgs, KeyArgs, StoreArgs};
use deaddrop_core::DEFAULT_CHUNK_SIZE;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::relay::Relay;

#[derive(Parser, Debug)]
#[command(name = "deaddrop-server")]
#[command(about = "Relay request blobs to their destinations and publish the responses")]
struct Args {
    /// Poll interval in milliseconds for the requests folder
    #[arg(short, long, env = "DEADDROP_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Pause in milliseconds after a failed listing
    #[arg(short, long, env = "DEADDROP_ERROR_BACKOFF_MS", default_value_t = 5000)]
    error_backoff_ms: u64,

    /// Maximum bytes read from a destination into one response blob
    #[arg(short, long, env = "DEADDROP_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    folders: FolderArgs,

    #[command(flatten)]
    key: KeyArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.chunk_size == 0 {
        bail!("--chunk-size must be at least 1");
    }

    info!(
        store = ?args.store.store,
        requests_folder = %args.folders.requests_folder,
        responses_folder = %args.folders.responses_folder,
        poll_interval_ms = args.poll_interval_ms,
        error_backoff_ms = args.error_backoff_ms,
        chunk_size = args.chunk_size,
        "Starting deaddrop relay"
    );

    let codec = args.key.codec().context("Invalid --key")?;
    let store = args.store.open().context("Failed to open blob store")?;

    let relay = Relay {
        store,
        codec: Arc::new(codec),
        requests_folder: args.folders.requests_folder,
        responses_folder: args.folders.responses_folder,
        chunk_size: args.chunk_size,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        error_backoff: Duration::from_millis(args.error_backoff_ms),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                on_signal.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {e}"),
        }
    });

    relay.run(cancel).await;
    Ok(())
}
