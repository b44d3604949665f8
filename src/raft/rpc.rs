//! Wire messages exchanged between Raft peers, and the `Transport` seam that carries them.
//!
//! The shapes here mirror the request/reply pairs from the Raft paper; they're carried as
//! variants of one enum, the same way peer-to-peer messages are modeled elsewhere in this
//! codebase (see [`crate::raft::net`]), so one length-prefixed JSON frame is enough for any kind
//! of RPC.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::log::LogEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: usize,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: usize,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// `None` when the follower's log is simply too short (see `conflict_index`).
    pub conflict_term: Option<u64>,
    pub conflict_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: usize,
    pub snapshot_last_index: u64,
    pub snapshot_last_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// One wire frame. Every peer-to-peer message, request or reply, is a variant of this enum so
/// the transport only ever has to move one kind of envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotArgs),
    InstallSnapshotReply(InstallSnapshotReply),
}

/// Best-effort unary RPC between peers, identified by a stable integer index `peer ∈ [0, N)`.
///
/// Implementations are free to fail (timeout, disconnect, refused connection); the caller treats
/// any `Err` as a dropped message and relies on the normal replication/heartbeat cadence to retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, peer: usize, msg: RaftMessage) -> anyhow::Result<RaftMessage>;
}
