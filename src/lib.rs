//! A Raft-replicated shard controller: the consensus core in [`raft`], a dedup-aware
//! state-machine adapter in [`shardctrl`], and the client library in [`clerk`].

pub mod clerk;
pub mod raft;
pub mod shardctrl;
