//! The `Persister` seam and the encoding of a replica's durable state.
//!
//! A `Persister` is a durable byte-blob store with two slots, raft state and snapshot, written
//! atomically together (`save`) — the file-backed implementation keeps both slots in one file so
//! the write really is atomic as a pair, not just atomic per-slot. The encoding of the raft-state
//! slot is fixed by [`PersistentState`] (`current_term`, `voted_for`, `log`, the log itself
//! carrying the snapshot floor) via `bincode`, the same binary framing this codebase already uses
//! for wire-adjacent durable state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::log::Log;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<usize>,
    pub log: Log,
}

/// Durable storage for a single replica's raft-state blob and snapshot blob.
///
/// Both slots are written together by `save` so a crash never observes a raft-state update
/// without its matching snapshot (or vice versa). Implementations must serialize their own
/// writes internally (one replica never issues concurrent `save` calls, but a malformed caller
/// should not be able to corrupt the store).
#[async_trait]
pub trait Persister: Send + Sync {
    async fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>) -> anyhow::Result<()>;
    async fn read_raft_state(&self) -> anyhow::Result<Vec<u8>>;
    async fn read_snapshot(&self) -> anyhow::Result<Vec<u8>>;
}

pub fn encode_state(state: &PersistentState) -> Vec<u8> {
    bincode::serialize(state).expect("encoding persistent raft state never fails")
}

/// Decode a previously-persisted raft-state blob.
///
/// Per the error-handling design, a decode failure on restart is fatal: a corrupted raft-state
/// cannot safely continue, so the caller is expected to abort the process rather than limp along
/// with partially-trusted state.
pub fn decode_state(bytes: &[u8]) -> anyhow::Result<PersistentState> {
    bincode::deserialize(bytes).map_err(|e| anyhow::anyhow!("corrupted raft state: {e}"))
}

/// An in-memory `Persister`, used by tests and by the in-process cluster harness. Survives
/// restarts only for as long as the `Arc` handle is kept alive by the test.
pub struct MemoryPersister {
    inner: tokio::sync::Mutex<(Vec<u8>, Vec<u8>)>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        MemoryPersister {
            inner: tokio::sync::Mutex::new((Vec::new(), Vec::new())),
        }
    }
}

impl Default for MemoryPersister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().await;
        *guard = (raft_state, snapshot);
        Ok(())
    }

    async fn read_raft_state(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.inner.lock().await.0.clone())
    }

    async fn read_snapshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.inner.lock().await.1.clone())
    }
}

/// A file-backed `Persister`. Both slots live in a single file, framed as `u32` length-prefixed
/// blobs (the same big-endian length-prefix idiom [`super::net`] uses on the wire) so one
/// temp-file-then-rename swap covers the pair: a crash mid-write leaves either the previous
/// consistent pair or nothing at all, never a raft-state update paired with a stale or missing
/// snapshot.
pub struct FilePersister {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FilePersister {
    pub fn new(dir: impl AsRef<Path>, node_id: &str) -> Self {
        let dir = dir.as_ref();
        FilePersister {
            path: dir.join(format!("raft_persist_{node_id}.bin")),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// `u32` length of `raft_state`, `raft_state`, `u32` length of `snapshot`, `snapshot`.
    fn frame(raft_state: &[u8], snapshot: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + raft_state.len() + snapshot.len());
        buf.extend_from_slice(&(raft_state.len() as u32).to_be_bytes());
        buf.extend_from_slice(raft_state);
        buf.extend_from_slice(&(snapshot.len() as u32).to_be_bytes());
        buf.extend_from_slice(snapshot);
        buf
    }

    fn unframe(bytes: &[u8]) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        let err = || anyhow::anyhow!("corrupted combined persist file (torn write?)");
        if bytes.len() < 4 {
            return Err(err());
        }
        let state_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let state_start = 4;
        let state_end = state_start.checked_add(state_len).ok_or_else(err)?;
        if bytes.len() < state_end + 4 {
            return Err(err());
        }
        let snapshot_len =
            u32::from_be_bytes(bytes[state_end..state_end + 4].try_into().unwrap()) as usize;
        let snapshot_start = state_end + 4;
        let snapshot_end = snapshot_start.checked_add(snapshot_len).ok_or_else(err)?;
        if bytes.len() != snapshot_end {
            return Err(err());
        }
        Ok((
            bytes[state_start..state_end].to_vec(),
            bytes[snapshot_start..snapshot_end].to_vec(),
        ))
    }

    /// Read both slots out of the one combined file. An empty (never-written) file reads as two
    /// empty blobs rather than an error, matching the "nothing persisted yet" contract the two
    /// separate `read_*` methods need to preserve.
    async fn load(&self) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        Self::unframe(&bytes)
    }
}

#[async_trait]
impl Persister for FilePersister {
    async fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = Self::frame(&raft_state, &snapshot);
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    async fn read_raft_state(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.load().await?.0)
    }

    async fn read_snapshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.load().await?.1)
    }
}
