//! One shard-controller replica: brings up the Raft core, the client-facing listener, and the
//! dedup-aware adapter, then serves both until killed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info};
use shardraft::raft::{self, FilePersister, RaftConfig};
use shardraft::shardctrl::{self, ShardController, SnapshotPolicy};
use tokio::net::TcpListener;

/// Raft's own RPC traffic runs on `client_port + RAFT_PORT_OFFSET`, so one `--peers` list can
/// describe both the client-facing and the internal address of every replica.
const RAFT_PORT_OFFSET: u16 = 1000;

#[derive(Parser)]
#[command(version, about = "A replicated shard-controller node")]
struct Cli {
    /// Index of this replica into `--peers` (0-based).
    #[arg(long)]
    id: usize,

    /// Client-facing `host:port` for every replica, in replica-index order, including this one.
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Directory to persist Raft state and snapshots under. Defaults to an in-memory persister
    /// (state is lost on restart) when omitted, which is convenient for local experiments.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Compact the Raft log after this many applied commands. Disabled when omitted.
    #[arg(long)]
    snapshot_every: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.id >= cli.peers.len() {
        bail!("--id {} is out of range for {} peers", cli.id, cli.peers.len());
    }

    let raft_peer_addrs: Vec<String> = cli
        .peers
        .iter()
        .map(|addr| {
            let (host, port) = addr
                .rsplit_once(':')
                .unwrap_or_else(|| panic!("peer address {addr} is not host:port"));
            let port: u16 = port.parse().unwrap_or_else(|_| panic!("bad port in {addr}"));
            format!("{host}:{}", port + RAFT_PORT_OFFSET)
        })
        .collect();

    info!("replica {} starting, client peers {:?}", cli.id, cli.peers);

    let persister: Arc<dyn raft::Persister> = match &cli.data_dir {
        Some(dir) => Arc::new(FilePersister::new(dir.clone(), &cli.id.to_string())),
        None => Arc::new(raft::MemoryPersister::new()),
    };
    let transport = Arc::new(raft::net::TcpTransport::new(raft_peer_addrs.clone()));
    let (apply_tx, apply_rx) = raft::channel(64);

    let raft_node = raft::Raft::new(
        cli.peers.len(),
        cli.id,
        persister,
        transport,
        apply_tx,
        RaftConfig::default(),
    )
    .await;

    let raft_listener = TcpListener::bind(&raft_peer_addrs[cli.id]).await?;
    let raft_for_listener = raft_node.clone();
    tokio::spawn(async move {
        if let Err(e) = raft::net::serve(raft_listener, raft_for_listener).await {
            error!("raft listener exited: {e}");
        }
    });

    let controller = ShardController::new(
        raft_node,
        apply_rx,
        SnapshotPolicy {
            entries_between_snapshots: cli.snapshot_every,
        },
    );

    let client_listener = TcpListener::bind(&cli.peers[cli.id]).await?;
    info!(
        "replica {} serving clients on {}, raft on {}",
        cli.id, cli.peers[cli.id], raft_peer_addrs[cli.id]
    );
    shardctrl::serve_clients(client_listener, controller).await?;
    Ok(())
}
