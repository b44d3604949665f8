//! A Raft consensus library: leader election, log replication, persistence, and log compaction
//! via snapshots, with an apply pipeline that delivers committed entries to an upstream state
//! machine exactly once and in order.
//!
//! The public surface is deliberately small: [`Raft::new`], [`Raft::start`],
//! [`Raft::get_state`], [`Raft::snapshot`], [`Raft::kill`]/[`Raft::killed`], plus the
//! [`ApplyMsg`] stream a caller reads from. Everything else (the wire types, the log store, the
//! persistence encoding) is exposed for the concrete adapters in this crate (the shard
//! controller, the clerk, the TCP transport) to build on, but callers embedding just the
//! consensus engine only need the items re-exported here.

mod apply;
mod config;
mod consensus;
pub mod log;
pub mod net;
pub mod persist;
pub mod rpc;
mod state;

pub use apply::{channel, ApplyMsg, ApplyReceiver, ApplySender};
pub use config::RaftConfig;
pub use consensus::Raft;
pub use log::{LogEntry, LogLookupError};
pub use persist::{FilePersister, MemoryPersister, Persister};
pub use rpc::{RaftMessage, Transport};
pub use state::Role;
