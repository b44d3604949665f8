//! Brings up a small all-in-one-process cluster for local experimentation: `--nodes` replicas on
//! consecutive loopback ports, all using in-memory persistence, then drives a handful of Join /
//! Move / Query operations against it and prints what came back.
//!
//! This is a development convenience, not a test harness. The deterministic scenarios
//! (partition, crash-recover, conflicting suffix, and so on) live in `tests/`, where they run
//! against real `Raft` instances wired directly together rather than over loopback sockets.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;
use shardraft::clerk::{Clerk, QueryClerk};
use shardraft::raft::{self, net::TcpTransport, MemoryPersister, RaftConfig};
use shardraft::shardctrl::{self, ShardController, SnapshotPolicy};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(version, about = "Run a local in-memory shard-controller cluster")]
struct Cli {
    /// Number of replicas to start.
    #[arg(short = 'n', long, default_value = "3")]
    nodes: usize,

    /// First client-facing port; replica `i` listens on `base_port + i`, and its Raft RPC port
    /// on `base_port + i + 1000`.
    #[arg(short = 'b', long, default_value = "9000")]
    base_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let client_addrs: Vec<String> = (0..cli.nodes)
        .map(|i| format!("127.0.0.1:{}", cli.base_port + i as u16))
        .collect();
    let raft_addrs: Vec<String> = (0..cli.nodes)
        .map(|i| format!("127.0.0.1:{}", cli.base_port + 1000 + i as u16))
        .collect();

    for id in 0..cli.nodes {
        let peer_raft_addrs = raft_addrs.clone();
        let client_addr = client_addrs[id].clone();
        let raft_addr = raft_addrs[id].clone();
        let node_count = cli.nodes;
        tokio::spawn(async move {
            let persister = Arc::new(MemoryPersister::new());
            let transport = Arc::new(TcpTransport::new(peer_raft_addrs));
            let (apply_tx, apply_rx) = raft::channel(64);
            let raft_node = raft::Raft::new(
                node_count,
                id,
                persister,
                transport,
                apply_tx,
                RaftConfig::default(),
            )
            .await;

            let raft_listener = TcpListener::bind(&raft_addr).await.expect("bind raft port");
            let raft_for_listener = raft_node.clone();
            tokio::spawn(async move {
                let _ = raft::net::serve(raft_listener, raft_for_listener).await;
            });

            let controller = ShardController::new(
                raft_node,
                apply_rx,
                SnapshotPolicy {
                    entries_between_snapshots: None,
                },
            );
            let client_listener = TcpListener::bind(&client_addr).await.expect("bind client port");
            info!("node {id} up: client={client_addr} raft={raft_addr}");
            let _ = shardctrl::serve_clients(client_listener, controller).await;
        });
    }

    // Give elections a moment to settle before driving traffic.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let mut clerk = Clerk::new(client_addrs.clone());
    let mut groups = BTreeMap::new();
    groups.insert(1, vec!["127.0.0.1:7001".to_string()]);
    groups.insert(2, vec!["127.0.0.1:7002".to_string()]);
    clerk.join(groups).await;
    println!("joined groups 1, 2");

    let query_clerk = QueryClerk::new(client_addrs.clone());
    let config = query_clerk.query(-1).await;
    println!("{}", serde_json::to_string_pretty(&config)?);

    clerk.move_shard(0, 2).await;
    let config = query_clerk.query(-1).await;
    println!("after move:\n{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}
