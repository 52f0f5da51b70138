//! taper CLI — connect to the network, sync headers, watch addresses

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use taper::listener::{DownloadListener, Listener, PeerEventListener};
use taper::net::{dns_discover, Client, ClientConfig, NetworkParams};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taper", version, about = "Bitcoin SPV client")]
struct Args {
    /// Use testnet3 instead of mainnet
    #[arg(long)]
    testnet: bool,

    /// Data directory for the header snapshot
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Target number of peer connections
    #[arg(short = 'n', long, default_value_t = 10)]
    connections: usize,

    /// Base58 addresses to watch for payments
    #[arg(short, long)]
    watch: Vec<String>,

    /// Explicit peers (host:port); skips DNS discovery when given
    #[arg(short, long)]
    peer: Vec<SocketAddr>,
}

/// Logs download progress and pool membership.
struct LogListener;

impl DownloadListener for LogListener {
    fn download_started(&self, peer: SocketAddr, blocks_left: u32) {
        info!("downloading {} blocks from {}", blocks_left, peer);
    }

    fn progress(&self, percent: u32, blocks_downloaded: u32) {
        info!("chain download {}% complete ({} blocks)", percent, blocks_downloaded);
    }

    fn download_complete(&self) {
        info!("chain download complete");
    }
}

impl PeerEventListener for LogListener {
    fn on_peer_connected(&self, peer: SocketAddr, peer_count: usize) {
        info!("peer {} connected ({} total)", peer, peer_count);
    }

    fn on_peer_disconnected(&self, peer: SocketAddr, peer_count: usize) {
        info!("peer {} disconnected ({} total)", peer, peer_count);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let params = NetworkParams::for_network(args.testnet);

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        warn!("cannot create {}: {}", args.data_dir.display(), e);
    }
    let mut config = ClientConfig::new(params);
    config.max_connections = args.connections;
    config.snapshot_path = Some(args.data_dir.join("headers.dat"));

    let candidates = if args.peer.is_empty() {
        dns_discover(args.testnet).await
    } else {
        args.peer.clone()
    };
    if candidates.is_empty() {
        warn!("no peer candidates; will keep retrying discovery");
    }

    let client = Arc::new(Client::new(candidates, config));
    let log = Arc::new(LogListener);
    client.add_listener(Listener::Download(log.clone()));
    client.add_listener(Listener::PeerEvents(log));

    for address in &args.watch {
        let watched = address.clone();
        let result = client
            .subscribe_address(
                address,
                Arc::new(move |event: taper::TxNotification| {
                    info!(
                        "tx {} touches {} ({} confirmations)",
                        event.txid, watched, event.confirmations
                    );
                }),
            )
            .await;
        if let Err(e) = result {
            warn!("cannot watch {}: {}", address, e);
        }
    }

    tokio::select! {
        _ = client.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            client.shutdown().await;
        }
    }
}
