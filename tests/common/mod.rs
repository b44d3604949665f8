//! An in-process `Transport` that dispatches directly between `Raft` instances in the same test
//! binary, with the ability to simulate a network partition by disconnecting a peer. This is the
//! same shape as the Go test harness this system's integration tests grew out of: no sockets, no
//! timing surprises beyond the ones Raft itself has to tolerate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shardraft::raft::{RaftMessage, Transport};

pub struct LocalNetwork {
    nodes: Mutex<Vec<Option<shardraft::raft::Raft>>>,
    disconnected: Mutex<HashSet<usize>>,
}

impl LocalNetwork {
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(LocalNetwork {
            nodes: Mutex::new(vec![None; n]),
            disconnected: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(&self, i: usize, raft: shardraft::raft::Raft) {
        self.nodes.lock().unwrap()[i] = Some(raft);
    }

    pub fn disconnect(&self, i: usize) {
        self.disconnected.lock().unwrap().insert(i);
    }

    pub fn reconnect(&self, i: usize) {
        self.disconnected.lock().unwrap().remove(&i);
    }
}

pub struct LocalTransport {
    from: usize,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    pub fn new(from: usize, network: Arc<LocalNetwork>) -> Self {
        LocalTransport { from, network }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, peer: usize, msg: RaftMessage) -> anyhow::Result<RaftMessage> {
        {
            let disconnected = self.network.disconnected.lock().unwrap();
            if disconnected.contains(&self.from) || disconnected.contains(&peer) {
                anyhow::bail!("peer {peer} unreachable (simulated partition)");
            }
        }
        let target = {
            let nodes = self.network.nodes.lock().unwrap();
            nodes
                .get(peer)
                .and_then(|slot| slot.clone())
                .ok_or_else(|| anyhow::anyhow!("peer {peer} not registered"))?
        };
        match msg {
            RaftMessage::RequestVote(args) => Ok(RaftMessage::RequestVoteReply(
                target.handle_request_vote(args).await,
            )),
            RaftMessage::AppendEntries(args) => Ok(RaftMessage::AppendEntriesReply(
                target.handle_append_entries(args).await,
            )),
            RaftMessage::InstallSnapshot(args) => Ok(RaftMessage::InstallSnapshotReply(
                target.handle_install_snapshot(args).await,
            )),
            RaftMessage::RequestVoteReply(_)
            | RaftMessage::AppendEntriesReply(_)
            | RaftMessage::InstallSnapshotReply(_) => {
                anyhow::bail!("a reply was sent as if it were a request")
            }
        }
    }
}
