//! The Raft replica: role transitions, the RequestVote/AppendEntries/InstallSnapshot handlers,
//! commit advancement, and the tickers that drive elections and heartbeats. This is the hard
//! core of the crate; everything else exists to give it something real to run against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rand::Rng;
use tokio::sync::{Mutex, MutexGuard, Notify};

use super::apply::{ApplyMsg, ApplySender};
use super::config::RaftConfig;
use super::log::{LogEntry, LogLookupError};
use super::persist::{decode_state, encode_state, Persister, PersistentState};
use super::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RaftMessage, RequestVoteArgs, RequestVoteReply, Transport,
};
use super::state::{RaftState, Role};

struct Inner {
    me: usize,
    peer_count: usize,
    state: Mutex<RaftState>,
    persister: Arc<dyn Persister>,
    transport: Arc<dyn Transport>,
    apply_tx: ApplySender,
    config: RaftConfig,
    dead: AtomicBool,
    /// Signalled whenever `commit_index` advances or a snapshot is installed, so the applier
    /// task can wake up without polling.
    apply_notify: Notify,
}

/// A single Raft replica. Cheap to clone (an `Arc` around the shared state and its long-lived
/// tasks); cloning does not spawn new tasks.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

impl Raft {
    /// Create a replica, recovering from `persister` if it already holds state, and start its
    /// background tasks (election ticker, heartbeat ticker, applier). Returns quickly; the
    /// long-running work happens in spawned tasks, matching `Make`'s contract.
    pub async fn new(
        peer_count: usize,
        me: usize,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn Transport>,
        apply_tx: ApplySender,
        config: RaftConfig,
    ) -> Raft {
        let mut state = RaftState::new();

        let raft_state_bytes = persister.read_raft_state().await.unwrap_or_default();
        if raft_state_bytes.is_empty() {
            debug!("[{me}] no previous state to recover from, starting fresh");
        } else {
            match decode_state(&raft_state_bytes) {
                Ok(persisted) => {
                    state.current_term = persisted.current_term;
                    state.voted_for = persisted.voted_for;
                    state.log = persisted.log;
                    info!(
                        "[{me}] recovered term={} voted_for={:?} last_log_index={}",
                        state.current_term,
                        state.voted_for,
                        state.log.last_index()
                    );
                }
                Err(e) => {
                    // I-7: a corrupted raft-state cannot safely continue.
                    panic!("[{me}] failed to decode persisted raft state: {e}");
                }
            }
        }

        let snapshot = persister.read_snapshot().await.unwrap_or_default();
        if !snapshot.is_empty() && state.log.snapshot_last_index() > 0 {
            // Recovered state already includes a snapshot ahead of anything we've applied. Don't
            // hand it to the apply channel here, and don't bump `last_applied` yet either: the
            // applier task (the crate's single apply-channel producer, see `spawn_applier`) is the
            // only thing that advances `last_applied`, and it does so only once it has actually
            // delivered the message. Recording it as `pending_snapshot` routes recovery through the
            // same path `handle_install_snapshot` uses, instead of two separate ways to get a
            // snapshot onto the channel.
            state.commit_index = state.commit_index.max(state.log.snapshot_last_index());
            state.pending_snapshot = Some((
                snapshot.clone(),
                state.log.snapshot_last_index(),
                state.log.snapshot_last_term(),
            ));
            state.snapshot = snapshot;
        }

        state.election_deadline = next_election_deadline(&config);

        let inner = Arc::new(Inner {
            me,
            peer_count,
            state: Mutex::new(state),
            persister,
            transport,
            apply_tx,
            config,
            dead: AtomicBool::new(false),
            apply_notify: Notify::new(),
        });
        let raft = Raft { inner };

        raft.spawn_election_ticker();
        raft.spawn_heartbeat_ticker();
        raft.spawn_applier();

        raft
    }

    // ---------------------------------------------------------------- external API

    /// `Start`: append `command` if this replica is the leader. Returns immediately; replication
    /// happens in the background. The returned `(index, term)` is a promise, not a commitment:
    /// callers must watch the apply channel for confirmation.
    pub async fn start(&self, command: Vec<u8>) -> (u64, u64, bool) {
        let mut state = self.inner.state.lock().await;
        if !state.is_leader() {
            return (0, state.current_term, false);
        }
        let index = state.log.last_index() + 1;
        let term = state.current_term;
        state.log.append(LogEntry {
            term,
            index,
            command,
        });
        if let Some(leader) = state.leader_state.as_mut() {
            leader.match_index.insert(self.inner.me, index);
            leader.next_index.insert(self.inner.me, index + 1);
        }
        self.persist_locked(&state).await;
        drop(state);

        self.broadcast_append_entries();
        (index, term, true)
    }

    /// `GetState`: current term and whether this replica believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.inner.state.lock().await;
        (state.current_term, state.is_leader())
    }

    /// `Snapshot`: the upstream state machine has applied through `index` and wants to compact.
    /// Ignored if `index` has already been compacted; must not block the applier.
    pub async fn snapshot(&self, index: u64, data: Vec<u8>) {
        let mut state = self.inner.state.lock().await;
        if index <= state.log.snapshot_last_index() {
            return;
        }
        let term = match state.log.term_at(index) {
            Ok(t) => t,
            Err(_) => {
                warn!(
                    "[{}] snapshot requested at index {index} outside the local log, ignoring",
                    self.inner.me
                );
                return;
            }
        };
        state.log.compact(index, term);
        state.snapshot = data;
        self.persist_locked(&state).await;
    }

    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::SeqCst);
    }

    pub fn killed(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------- RPC handlers
    // These run with the replica lock held for the entire body (no outbound network call is made
    // from a handler), releasing it only implicitly when the guard drops at the end.

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.inner.state.lock().await;

        if args.term < state.current_term {
            return RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            };
        }
        if args.term > state.current_term {
            state.step_down(args.term);
        }

        let can_vote = state.voted_for.is_none() || state.voted_for == Some(args.candidate_id);
        let up_to_date = state.log_is_at_least_as_up_to_date(args.last_log_term, args.last_log_index);

        let vote_granted = can_vote && up_to_date;
        if vote_granted {
            state.voted_for = Some(args.candidate_id);
            state.msg_received = true;
            self.persist_locked(&state).await;
            info!(
                "[{}] granted vote to {} for term {}",
                self.inner.me, args.candidate_id, args.term
            );
        } else {
            trace!(
                "[{}] denied vote to {} for term {} (can_vote={can_vote} up_to_date={up_to_date})",
                self.inner.me,
                args.candidate_id,
                args.term
            );
        }

        RequestVoteReply {
            term: state.current_term,
            vote_granted,
        }
    }

    pub async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut state = self.inner.state.lock().await;

        if args.term < state.current_term {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                conflict_term: None,
                conflict_index: state.log.last_index() + 1,
            };
        }
        if args.term > state.current_term {
            state.step_down(args.term);
        }
        state.role = Role::Follower;
        state.current_leader = Some(args.leader_id);
        state.msg_received = true;

        let snapshot_last_index = state.log.snapshot_last_index();

        // Entries already folded into our snapshot: trim them off and treat the rest normally.
        let (prev_log_index, prev_log_term, entries) = if args.prev_log_index < snapshot_last_index
        {
            let drop = (snapshot_last_index - args.prev_log_index) as usize;
            if drop >= args.entries.len() {
                // Everything the leader sent is already covered by our snapshot; report success
                // against our own snapshot boundary so the leader advances next_index past it.
                let success = AppendEntriesReply {
                    term: state.current_term,
                    success: true,
                    conflict_term: None,
                    conflict_index: 0,
                };
                self.persist_locked(&state).await;
                return success;
            }
            (
                snapshot_last_index,
                state.log.snapshot_last_term(),
                args.entries[drop..].to_vec(),
            )
        } else {
            (args.prev_log_index, args.prev_log_term, args.entries)
        };

        let last_log_index = state.log.last_index();
        if prev_log_index > last_log_index {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                conflict_term: None,
                conflict_index: last_log_index + 1,
            };
        }

        match state.log.term_at(prev_log_index) {
            Ok(term) if term == prev_log_term => {}
            Ok(term) => {
                let conflict_index = state
                    .log
                    .first_index_with_term(term)
                    .unwrap_or(prev_log_index);
                return AppendEntriesReply {
                    term: state.current_term,
                    success: false,
                    conflict_term: Some(term),
                    conflict_index,
                };
            }
            Err(LogLookupError::Compacted) => {
                // prev_log_index sits inside a region we've already compacted away under a
                // different term lineage than the one the leader thinks it has; ask for
                // everything from just past our snapshot.
                return AppendEntriesReply {
                    term: state.current_term,
                    success: false,
                    conflict_term: None,
                    conflict_index: snapshot_last_index + 1,
                };
            }
            Err(LogLookupError::OutOfRange) => {
                return AppendEntriesReply {
                    term: state.current_term,
                    success: false,
                    conflict_term: None,
                    conflict_index: last_log_index + 1,
                };
            }
        }

        let index_of_last_new_entry = prev_log_index + entries.len() as u64;
        if !entries.is_empty() {
            let commit_index = state.commit_index;
            state.log.merge(prev_log_index + 1, &entries, commit_index);
        }

        if args.leader_commit > state.commit_index {
            state.commit_index = args.leader_commit.min(index_of_last_new_entry);
            self.inner.apply_notify.notify_one();
        }

        self.persist_locked(&state).await;

        AppendEntriesReply {
            term: state.current_term,
            success: true,
            conflict_term: None,
            conflict_index: 0,
        }
    }

    pub async fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut state = self.inner.state.lock().await;

        if args.term < state.current_term {
            return InstallSnapshotReply {
                term: state.current_term,
            };
        }
        if args.term > state.current_term {
            state.step_down(args.term);
        }
        state.role = Role::Follower;
        state.current_leader = Some(args.leader_id);
        state.msg_received = true;

        if args.snapshot_last_index <= state.commit_index {
            // We already have equivalent or newer state.
            return InstallSnapshotReply {
                term: state.current_term,
            };
        }

        let keep_suffix = state.log.term_at(args.snapshot_last_index) == Ok(args.snapshot_last_term);
        if keep_suffix {
            state.log.compact(args.snapshot_last_index, args.snapshot_last_term);
        } else {
            state
                .log
                .reset_to_snapshot(args.snapshot_last_index, args.snapshot_last_term);
        }
        state.snapshot = args.data.clone();
        state.commit_index = state.commit_index.max(args.snapshot_last_index);
        // Don't touch `last_applied` or send on the apply channel here: the applier task
        // (`spawn_applier`) is the crate's single apply-channel producer, so installation just
        // records what's pending and wakes it. `last_applied` only advances once the applier has
        // actually delivered the message, preserving I6/P6/P7.
        state.pending_snapshot = Some((args.data, args.snapshot_last_index, args.snapshot_last_term));
        self.persist_locked(&state).await;
        self.inner.apply_notify.notify_one();

        InstallSnapshotReply {
            term: state.current_term,
        }
    }

    // ---------------------------------------------------------------- persistence

    async fn persist_locked(&self, state: &MutexGuard<'_, RaftState>) {
        let persistent = PersistentState {
            current_term: state.current_term,
            voted_for: state.voted_for,
            log: state.log.clone(),
        };
        let bytes = encode_state(&persistent);
        if let Err(e) = self
            .inner
            .persister
            .save(bytes, state.snapshot.clone())
            .await
        {
            warn!("[{}] failed to persist raft state: {e}", self.inner.me);
        }
    }

    // ---------------------------------------------------------------- election

    fn spawn_election_ticker(&self) {
        let raft = self.clone();
        tokio::spawn(async move {
            loop {
                if raft.killed() {
                    return;
                }
                tokio::time::sleep(raft.inner.config.tick_interval).await;

                let should_elect = {
                    let mut state = raft.inner.state.lock().await;
                    if state.role == Role::Leader {
                        state.election_deadline = next_election_deadline(&raft.inner.config);
                        false
                    } else if Instant::now() >= state.election_deadline && !state.msg_received {
                        state.election_deadline = next_election_deadline(&raft.inner.config);
                        true
                    } else {
                        if Instant::now() >= state.election_deadline {
                            state.msg_received = false;
                            state.election_deadline = next_election_deadline(&raft.inner.config);
                        }
                        false
                    }
                };

                if should_elect {
                    raft.start_election();
                }
            }
        });
    }

    fn start_election(&self) {
        let raft = self.clone();
        tokio::spawn(async move {
            let (term, args) = {
                let mut state = raft.inner.state.lock().await;
                state.become_candidate(raft.inner.me);
                state.msg_received = true;
                raft.persist_locked(&state).await;
                let term = state.current_term;
                let args = RequestVoteArgs {
                    term,
                    candidate_id: raft.inner.me,
                    last_log_index: state.log.last_index(),
                    last_log_term: state.log.last_term(),
                };
                info!("[{}] starting election for term {term}", raft.inner.me);
                (term, args)
            };

            let majority = raft.inner.peer_count / 2 + 1;
            let mut votes = 1usize; // vote for self
            if votes >= majority {
                raft.become_leader(term).await;
                return;
            }

            let mut handles = Vec::new();
            for peer in 0..raft.inner.peer_count {
                if peer == raft.inner.me {
                    continue;
                }
                let raft = raft.clone();
                let args = args.clone();
                handles.push(tokio::spawn(async move {
                    raft.inner
                        .transport
                        .call(peer, RaftMessage::RequestVote(args))
                        .await
                }));
            }

            for handle in handles {
                let Ok(Ok(RaftMessage::RequestVoteReply(reply))) = handle.await else {
                    continue;
                };

                let mut state = raft.inner.state.lock().await;
                if reply.term > state.current_term {
                    state.step_down(reply.term);
                    raft.persist_locked(&state).await;
                    return;
                }
                // Stale reply: we've moved on from the term (or role) this election was for.
                if state.role != Role::Candidate || state.current_term != term {
                    return;
                }
                drop(state);

                if reply.vote_granted {
                    votes += 1;
                    if votes >= majority {
                        raft.become_leader(term).await;
                        return;
                    }
                }
            }
        });
    }

    async fn become_leader(&self, term: u64) {
        {
            let mut state = self.inner.state.lock().await;
            if state.role != Role::Candidate || state.current_term != term {
                return;
            }
            state.become_leader(self.inner.me, self.inner.peer_count);
            info!("[{}] became leader for term {term}", self.inner.me);
        }
        self.broadcast_append_entries();
    }

    // ---------------------------------------------------------------- replication

    fn spawn_heartbeat_ticker(&self) {
        let raft = self.clone();
        tokio::spawn(async move {
            loop {
                if raft.killed() {
                    return;
                }
                tokio::time::sleep(raft.inner.config.heartbeat_interval).await;
                let is_leader = raft.inner.state.lock().await.is_leader();
                if is_leader {
                    raft.broadcast_append_entries();
                }
            }
        });
    }

    fn broadcast_append_entries(&self) {
        for peer in 0..self.inner.peer_count {
            if peer == self.inner.me {
                continue;
            }
            let raft = self.clone();
            tokio::spawn(async move {
                raft.replicate_to_peer(peer).await;
            });
        }
    }

    async fn replicate_to_peer(&self, peer: usize) {
        enum Plan {
            Append(AppendEntriesArgs),
            Snapshot(InstallSnapshotArgs),
            Skip,
        }

        let (term, plan) = {
            let state = self.inner.state.lock().await;
            if !state.is_leader() {
                return;
            }
            let term = state.current_term;
            let leader_state = match state.leader_state.as_ref() {
                Some(l) => l,
                None => return,
            };
            let next_index = *leader_state.next_index.get(&peer).unwrap_or(&1);

            let plan = if next_index <= state.log.snapshot_last_index() {
                Plan::Snapshot(InstallSnapshotArgs {
                    term,
                    leader_id: self.inner.me,
                    snapshot_last_index: state.log.snapshot_last_index(),
                    snapshot_last_term: state.log.snapshot_last_term(),
                    data: state.snapshot.clone(),
                })
            } else {
                let prev_log_index = next_index - 1;
                match state.log.term_at(prev_log_index) {
                    Ok(prev_log_term) => Plan::Append(AppendEntriesArgs {
                        term,
                        leader_id: self.inner.me,
                        prev_log_index,
                        prev_log_term,
                        entries: state.log.entries_after(prev_log_index),
                        leader_commit: state.commit_index,
                    }),
                    // Raced with a local compaction; fall back to a snapshot next round.
                    Err(_) => Plan::Skip,
                }
            };
            (term, plan)
        };

        match plan {
            Plan::Skip => {}
            Plan::Append(args) => {
                let prev_log_index = args.prev_log_index;
                let entries_len = args.entries.len() as u64;
                let Ok(RaftMessage::AppendEntriesReply(reply)) = self
                    .inner
                    .transport
                    .call(peer, RaftMessage::AppendEntries(args))
                    .await
                else {
                    return;
                };
                self.handle_append_entries_reply(
                    peer,
                    term,
                    prev_log_index,
                    prev_log_index + 1,
                    entries_len,
                    reply,
                )
                .await;
            }
            Plan::Snapshot(args) => {
                let snapshot_last_index = args.snapshot_last_index;
                let Ok(RaftMessage::InstallSnapshotReply(reply)) = self
                    .inner
                    .transport
                    .call(peer, RaftMessage::InstallSnapshot(args))
                    .await
                else {
                    return;
                };
                self.handle_install_snapshot_reply(peer, term, snapshot_last_index, reply)
                    .await;
            }
        }
    }

    async fn handle_append_entries_reply(
        &self,
        peer: usize,
        sent_term: u64,
        prev_log_index: u64,
        sent_next_index: u64,
        entries_len: u64,
        reply: AppendEntriesReply,
    ) {
        let mut state = self.inner.state.lock().await;
        if reply.term > state.current_term {
            state.step_down(reply.term);
            self.persist_locked(&state).await;
            return;
        }
        if state.current_term != sent_term || !state.is_leader() {
            return; // stale: term moved on, or we're no longer leader
        }
        let Some(leader) = state.leader_state.as_mut() else {
            return;
        };

        if reply.success {
            let new_match = prev_log_index + entries_len;
            let cur_match = *leader.match_index.get(&peer).unwrap_or(&0);
            if new_match > cur_match {
                leader.match_index.insert(peer, new_match);
                leader.next_index.insert(peer, new_match + 1);
            }
            self.advance_commit_index(&mut state);
            return;
        }

        // A failure reply only describes the world as of `sent_next_index`; if `next_index[peer]`
        // has already moved on (a more recent exchange processed first, or a success reply beat
        // this one back), this reply is stale and must not regress it.
        if *leader.next_index.get(&peer).unwrap_or(&1) != sent_next_index {
            return;
        }

        if let Some(conflict_term) = reply.conflict_term {
            let fallback = reply.conflict_index;
            let next = match state.log.last_index_with_term(conflict_term) {
                Some(idx) => idx + 1,
                None => fallback,
            };
            state
                .leader_state
                .as_mut()
                .unwrap()
                .next_index
                .insert(peer, next.max(1));
        } else {
            leader.next_index.insert(peer, reply.conflict_index.max(1));
        }
    }

    async fn handle_install_snapshot_reply(
        &self,
        peer: usize,
        sent_term: u64,
        snapshot_last_index: u64,
        reply: InstallSnapshotReply,
    ) {
        let mut state = self.inner.state.lock().await;
        if reply.term > state.current_term {
            state.step_down(reply.term);
            self.persist_locked(&state).await;
            return;
        }
        if state.current_term != sent_term || !state.is_leader() {
            return;
        }
        if let Some(leader) = state.leader_state.as_mut() {
            let next = snapshot_last_index + 1;
            if *leader.next_index.get(&peer).unwrap_or(&0) < next {
                leader.next_index.insert(peer, next);
                leader.match_index.insert(peer, snapshot_last_index);
            }
        }
    }

    /// Find the largest `N > commit_index` replicated on a majority with `term_at(N) ==
    /// current_term`, and commit it. Must be called with the replica lock held.
    fn advance_commit_index(&self, state: &mut RaftState) {
        if !state.is_leader() {
            return;
        }
        let current_term = state.current_term;
        let me = self.inner.me;
        let last_index = state.log.last_index();
        let mut candidate = state.commit_index;

        let match_index: HashMap<usize, u64> = match state.leader_state.as_ref() {
            Some(l) => l.match_index.clone(),
            None => return,
        };
        let majority = self.inner.peer_count / 2 + 1;

        let mut n = last_index;
        while n > state.commit_index {
            if state.log.term_at(n) == Ok(current_term) {
                let mut count = 1; // leader itself
                for (&peer, &matched) in match_index.iter() {
                    if peer != me && matched >= n {
                        count += 1;
                    }
                }
                if count >= majority {
                    candidate = n;
                    break;
                }
            }
            n -= 1;
        }

        if candidate > state.commit_index {
            state.commit_index = candidate;
            self.inner.apply_notify.notify_one();
        }
    }

    // ---------------------------------------------------------------- apply pipeline

    /// The crate's single apply-channel producer: a snapshot pending from `handle_install_snapshot`
    /// (or restored at recovery) is always drained before any command batch, so a `Snapshot`
    /// message for index `s` is never interleaved with or overtaken by `Command` messages this
    /// same task is still mid-send for at a lower index (I6/P6/P7). `pending_snapshot` and
    /// `commit_index`/`last_applied` are only ever mutated under the replica lock, and only this
    /// task ever sends on `apply_tx`, so there is exactly one serialization point.
    fn spawn_applier(&self) {
        let raft = self.clone();
        tokio::spawn(async move {
            enum Action {
                Snapshot { data: Vec<u8>, index: u64, term: u64 },
                Commands(Vec<LogEntry>),
                Wait,
            }

            loop {
                if raft.killed() {
                    return;
                }
                let action = {
                    let mut state = raft.inner.state.lock().await;
                    if let Some((data, index, term)) = state.pending_snapshot.take() {
                        Action::Snapshot { data, index, term }
                    } else if state.commit_index <= state.last_applied {
                        Action::Wait
                    } else {
                        let from = state.last_applied + 1;
                        let to = state.commit_index;
                        let mut entries = Vec::with_capacity((to - from + 1) as usize);
                        for idx in from..=to {
                            if let Some(entry) = state.log.entry_at(idx) {
                                entries.push(entry.clone());
                            }
                        }
                        Action::Commands(entries)
                    }
                };

                match action {
                    Action::Wait => {
                        raft.inner.apply_notify.notified().await;
                    }
                    Action::Snapshot { data, index, term } => {
                        let msg = ApplyMsg::Snapshot { data, index, term };
                        if raft.inner.apply_tx.send(msg).await.is_err() {
                            return; // consumer gone
                        }
                        let mut state = raft.inner.state.lock().await;
                        state.last_applied = state.last_applied.max(index);
                    }
                    Action::Commands(entries) => {
                        for entry in entries {
                            let msg = ApplyMsg::Command {
                                command: entry.command,
                                index: entry.index,
                                term: entry.term,
                            };
                            if raft.inner.apply_tx.send(msg).await.is_err() {
                                return; // consumer gone
                            }
                            let mut state = raft.inner.state.lock().await;
                            state.last_applied = state.last_applied.max(entry.index);
                        }
                    }
                }
            }
        });
    }
}

fn next_election_deadline(config: &RaftConfig) -> Instant {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    let millis = if max > min {
        rand::thread_rng().gen_range(min..max)
    } else {
        min
    };
    Instant::now() + Duration::from_millis(millis)
}
