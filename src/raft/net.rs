//! A concrete `Transport`: length-prefixed JSON frames over TCP, one connection per call. This
//! is the same wire idiom this codebase already used for peer-to-peer messages before the
//! rewrite (a `u32` big-endian length prefix followed by a `serde_json`-encoded frame), just
//! generalized to the [`RaftMessage`] envelope.

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::consensus::Raft;
use super::rpc::{RaftMessage, Transport};

/// Reads one length-prefixed JSON frame from `stream`.
async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<RaftMessage> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Writes one length-prefixed JSON frame to `stream`.
async fn write_frame(stream: &mut TcpStream, msg: &RaftMessage) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(msg)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// A `Transport` backed by plain TCP connections, addressed by peer index into a fixed address
/// list (`peers[me]` is this replica's own listen address and is never dialed).
pub struct TcpTransport {
    peer_addrs: Vec<String>,
}

impl TcpTransport {
    pub fn new(peer_addrs: Vec<String>) -> Self {
        TcpTransport { peer_addrs }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, peer: usize, msg: RaftMessage) -> anyhow::Result<RaftMessage> {
        let addr = self
            .peer_addrs
            .get(peer)
            .ok_or_else(|| anyhow::anyhow!("no address configured for peer {peer}"))?;
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &msg).await?;
        read_frame(&mut stream).await
    }
}

/// Accepts connections on `listener` and dispatches each inbound [`RaftMessage`] request to the
/// matching handler on `raft`, replying on the same connection. Runs until the listener errors or
/// the replica is killed; intended to be spawned as its own task by the binary wiring up a node.
pub async fn serve(listener: TcpListener, raft: Raft) -> anyhow::Result<()> {
    loop {
        if raft.killed() {
            return Ok(());
        }
        let (mut stream, peer_addr) = listener.accept().await?;
        let raft = raft.clone();
        tokio::spawn(async move {
            let request = match read_frame(&mut stream).await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping malformed frame from {peer_addr}: {e}");
                    return;
                }
            };
            let reply = match request {
                RaftMessage::RequestVote(args) => {
                    RaftMessage::RequestVoteReply(raft.handle_request_vote(args).await)
                }
                RaftMessage::AppendEntries(args) => {
                    RaftMessage::AppendEntriesReply(raft.handle_append_entries(args).await)
                }
                RaftMessage::InstallSnapshot(args) => {
                    RaftMessage::InstallSnapshotReply(raft.handle_install_snapshot(args).await)
                }
                // Replies only ever arrive as the response half of `call`, never unsolicited.
                RaftMessage::RequestVoteReply(_)
                | RaftMessage::AppendEntriesReply(_)
                | RaftMessage::InstallSnapshotReply(_) => return,
            };
            if let Err(e) = write_frame(&mut stream, &reply).await {
                debug!("failed to reply to {peer_addr}: {e}");
            }
        });
    }
}
