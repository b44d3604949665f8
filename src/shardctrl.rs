//! A minimal dedup-aware state-machine adapter sitting on top of the Raft core: a shard
//! controller that tracks a sequence of `Config` generations and lets clerks `Join` groups,
//! `Leave` groups, `Move` a shard, or `Query` a generation.
//!
//! The rebalancing policy here is intentionally unsophisticated: it exists to give the adapter
//! real state to mutate and to exercise the dedup/apply contract, not to explore shard-placement
//! strategy. The dedup table is the part that matters: every write is tagged with
//! `(clerk_id, seq_num)`, and a retried write is answered from cache instead of being re-applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};

use crate::raft::{ApplyMsg, ApplyReceiver, Raft};

/// Number of shards tracked by every `Config`. Fixed and small deliberately; this is a teaching
/// fixture, not a tunable production parameter.
pub const NUM_SHARDS: usize = 10;

/// Group id `0` means "unassigned" (no group currently owns that shard).
pub const UNASSIGNED: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub num: u64,
    pub shards: [u64; NUM_SHARDS],
    pub groups: BTreeMap<u64, Vec<String>>,
}

impl Config {
    fn initial() -> Self {
        Config {
            num: 0,
            shards: [UNASSIGNED; NUM_SHARDS],
            groups: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Join { groups: BTreeMap<u64, Vec<String>> },
    Leave { gids: Vec<u64> },
    Move { shard: usize, gid: u64 },
    Query { num: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Config(Config),
    Ack,
}

/// One client operation: `seq_num` is the clerk's monotonically increasing write counter, used
/// for dedup. `Query` operations carry `seq_num = -1`: queries are idempotent reads and are
/// never deduplicated (mirrors the `MakeClerk`/`MakeQueryClerk` split this system inherited).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub clerk_id: u64,
    pub seq_num: i64,
    pub op: Op,
}

/// Wire request/reply between a [`crate::clerk::Clerk`] and the controller's client-facing
/// listener. Distinct from the internal Raft RPC envelope: clerks never speak Raft's protocol
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientReply {
    pub succeeded: bool,
    pub reply: Option<Reply>,
}

struct ControllerState {
    configs: Vec<Config>,
    /// Highest `seq_num` applied per clerk, with the reply that resulted, so a retried write
    /// returns the same answer without being re-applied.
    dedup: HashMap<u64, (i64, Reply)>,
}

impl ControllerState {
    fn new() -> Self {
        ControllerState {
            configs: vec![Config::initial()],
            dedup: HashMap::new(),
        }
    }

    fn latest(&self) -> &Config {
        self.configs.last().expect("configs always has at least the initial generation")
    }

    fn apply(&mut self, clerk_id: u64, seq_num: i64, op: Op) -> Reply {
        if let Op::Query { num } = op {
            let config = if num < 0 || num as usize >= self.configs.len() {
                self.latest().clone()
            } else {
                self.configs[num as usize].clone()
            };
            return Reply::Config(config);
        }

        if let Some((last_seq, cached)) = self.dedup.get(&clerk_id) {
            if seq_num <= *last_seq {
                return cached.clone();
            }
        }

        let reply = match op {
            Op::Join { groups } => {
                let mut next = self.latest().clone();
                next.num += 1;
                next.groups.extend(groups);
                next.shards = rebalance(&next.groups);
                self.configs.push(next);
                Reply::Ack
            }
            Op::Leave { gids } => {
                let mut next = self.latest().clone();
                next.num += 1;
                for gid in gids {
                    next.groups.remove(&gid);
                }
                next.shards = rebalance(&next.groups);
                self.configs.push(next);
                Reply::Ack
            }
            Op::Move { shard, gid } => {
                let mut next = self.latest().clone();
                next.num += 1;
                if shard < NUM_SHARDS {
                    next.shards[shard] = gid;
                }
                self.configs.push(next);
                Reply::Ack
            }
            Op::Query { .. } => unreachable!("handled above"),
        };

        self.dedup.insert(clerk_id, (seq_num, reply.clone()));
        reply
    }
}

/// Spread shards evenly across the current group set, in ascending gid order. Deliberately
/// ignores the previous assignment: a full reshuffle on every membership change.
fn rebalance(groups: &BTreeMap<u64, Vec<String>>) -> [u64; NUM_SHARDS] {
    let mut shards = [UNASSIGNED; NUM_SHARDS];
    if groups.is_empty() {
        return shards;
    }
    let gids: Vec<u64> = groups.keys().copied().collect();
    for (i, shard) in shards.iter_mut().enumerate() {
        *shard = gids[i % gids.len()];
    }
    shards
}

/// How often (in applied commands) the adapter asks Raft to compact the log, once the threshold
/// is configured. `None` disables automatic snapshotting (tests that want to see every entry
/// without losing them to compaction use this).
pub struct SnapshotPolicy {
    pub entries_between_snapshots: Option<u64>,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy {
            entries_between_snapshots: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotImage {
    configs: Vec<Config>,
    dedup: Vec<(u64, i64, Reply)>,
}

/// The replicated shard-controller: the dedup-aware adapter that drives the apply loop and
/// exposes `request` (append-and-wait) to the client-facing listener.
pub struct ShardController {
    raft: Raft,
    state: Arc<Mutex<ControllerState>>,
    waiters: Arc<Mutex<HashMap<u64, (u64, oneshot::Sender<Reply>)>>>,
    snapshot_policy: SnapshotPolicy,
    applied_since_snapshot: Arc<Mutex<u64>>,
}

impl ShardController {
    pub fn new(raft: Raft, mut apply_rx: ApplyReceiver, snapshot_policy: SnapshotPolicy) -> Arc<Self> {
        let controller = Arc::new(ShardController {
            raft,
            state: Arc::new(Mutex::new(ControllerState::new())),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            snapshot_policy,
            applied_since_snapshot: Arc::new(Mutex::new(0)),
        });

        let worker = Arc::clone(&controller);
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                worker.handle_apply_msg(msg).await;
            }
        });

        controller
    }

    async fn handle_apply_msg(&self, msg: ApplyMsg) {
        match msg {
            ApplyMsg::Command { command, index, .. } => {
                let decoded: Command = match bincode::deserialize(&command) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("failed to decode applied command at index {index}: {e}");
                        return;
                    }
                };
                let clerk_id = decoded.clerk_id;
                let seq_num = decoded.seq_num;
                let reply = {
                    let mut state = self.state.lock().await;
                    state.apply(clerk_id, seq_num, decoded.op)
                };

                if let Some((waiting_clerk, sender)) = self.waiters.lock().await.remove(&index) {
                    if waiting_clerk == clerk_id {
                        let _ = sender.send(reply);
                    }
                    // Else: a different command landed at the index we proposed at, meaning we
                    // lost leadership between `start` and commit. The waiter's receiver observes
                    // the sender being dropped and reports "not leader" to its caller.
                }

                self.maybe_snapshot(index).await;
            }
            ApplyMsg::Snapshot { data, index, .. } => {
                if let Ok(image) = bincode::deserialize::<SnapshotImage>(&data) {
                    let mut state = self.state.lock().await;
                    state.configs = image.configs;
                    state.dedup = image.dedup.into_iter().map(|(k, v, r)| (k, (v, r))).collect();
                }
                debug!("installed snapshot through index {index}");
            }
        }
    }

    async fn maybe_snapshot(&self, applied_index: u64) {
        let Some(threshold) = self.snapshot_policy.entries_between_snapshots else {
            return;
        };
        let mut count = self.applied_since_snapshot.lock().await;
        *count += 1;
        if *count < threshold {
            return;
        }
        *count = 0;
        let image = {
            let state = self.state.lock().await;
            SnapshotImage {
                configs: state.configs.clone(),
                dedup: state
                    .dedup
                    .iter()
                    .map(|(k, (v, r))| (*k, *v, r.clone()))
                    .collect(),
            }
        };
        let bytes = bincode::serialize(&image).expect("snapshot image always encodes");
        self.raft.snapshot(applied_index, bytes).await;
    }

    /// Propose `op` through Raft and wait for it to be applied. Returns `None` if this replica
    /// was not (or stopped being) the leader for the proposal.
    pub async fn request(&self, clerk_id: u64, seq_num: i64, op: Op) -> Option<Reply> {
        if let Op::Query { num } = op {
            // Reads still go through Raft (no read-lease / witness support, per non-goals) so a
            // stale follower can't answer with old data: propose a no-op-shaped Query command and
            // let the apply loop resolve it from the state as of that index.
            return self.propose(clerk_id, -1, Op::Query { num }).await;
        }
        self.propose(clerk_id, seq_num, op).await
    }

    async fn propose(&self, clerk_id: u64, seq_num: i64, op: Op) -> Option<Reply> {
        let command = Command {
            clerk_id,
            seq_num,
            op,
        };
        let bytes = bincode::serialize(&command).expect("command always encodes");
        let (index, term, is_leader) = self.raft.start(bytes).await;
        if !is_leader {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(index, (clerk_id, tx));

        match tokio::time::timeout(Duration::from_secs(2), rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => {
                self.waiters.lock().await.remove(&index);
                // Either the wait timed out or the sender was dropped (lost leadership before
                // commit). Double check: if we're still leader at the same term, the entry may
                // simply be slow; the caller's own retry loop covers that case.
                let (current_term, current_is_leader) = self.raft.get_state().await;
                if current_is_leader && current_term == term {
                    info!("proposal at index {index} is taking a while to apply");
                }
                None
            }
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<ClientRequest> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

async fn write_frame(stream: &mut TcpStream, reply: &ClientReply) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(reply)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Accepts client requests on `listener` and answers them via `controller`, until the listener
/// errors. Intended to be spawned as its own task alongside [`crate::raft::net::serve`].
pub async fn serve_clients(listener: TcpListener, controller: Arc<ShardController>) -> anyhow::Result<()> {
    loop {
        let (mut stream, peer_addr) = listener.accept().await?;
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let request = match read_frame(&mut stream).await {
                Ok(r) => r,
                Err(e) => {
                    debug!("dropping malformed client frame from {peer_addr}: {e}");
                    return;
                }
            };
            let reply = match controller
                .request(
                    request.command.clerk_id,
                    request.command.seq_num,
                    request.command.op,
                )
                .await
            {
                Some(reply) => ClientReply {
                    succeeded: true,
                    reply: Some(reply),
                },
                None => ClientReply {
                    succeeded: false,
                    reply: None,
                },
            };
            if let Err(e) = write_frame(&mut stream, &reply).await {
                debug!("failed to reply to client {peer_addr}: {e}");
            }
        });
    }
}
