mod registry;
mod session;
mod socks5;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use deaddrop_core::config::{FolderArgs, KeyArgs, StoreArgs};
use deaddrop_core::DEFAULT_CHUNK_SIZE;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::registry::SessionRegistry;
use crate::session::Tunnel;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "deaddrop-client")]
#[command(about = "SOCKS5 proxy that tunnels traffic through a shared blob store")]
struct Args {
    /// Local address to listen on for SOCKS5 connections
    #[arg(short, long, env = "DEADDROP_LISTEN", default_value = "127.0.0.1:1080")]
    listen: String,

    /// Poll interval in milliseconds for the responses folder
    #[arg(short, long, env = "DEADDROP_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Maximum bytes read from a local socket into one request blob
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
        listen = %args.listen,
        store = ?args.store.store,
        requests_folder = %args.folders.requests_folder,
        responses_folder = %args.folders.responses_folder,
        poll_interval_ms = args.poll_interval_ms,
        chunk_size = args.chunk_size,
        "Starting deaddrop SOCKS5 client"
    );

    let codec = args.key.codec().context("Invalid --key")?;
    let store = args.store.open().context("Failed to open blob store")?;
    let registry = SessionRegistry::new();

    let tunnel = Arc::new(Tunnel {
        store,
        codec: Arc::new(codec),
        requests_folder: args.folders.requests_folder,
        responses_folder: args.folders.responses_folder,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        chunk_size: args.chunk_size,
        registry: registry.clone(),
    });

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("SOCKS5 server listening on {}", args.listen);

    tokio::select! {
        res = socks5::serve(listener, tunnel) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, cancelling {} active sessions", registry.len());
            registry.shutdown(SHUTDOWN_GRACE).await;
        }
    }

    Ok(())
}
