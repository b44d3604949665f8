//! Per-replica state: the persistent fields (flushed before any RPC reply that depends on them)
//! and the volatile fields (role, commit/apply cursors, and the leader-only replication
//! bookkeeping).

use std::collections::HashMap;
use std::time::Instant;

use super::log::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Leader-only replication state, one entry per peer other than `me`.
#[derive(Debug, Default)]
pub struct LeaderState {
    pub next_index: HashMap<usize, u64>,
    pub match_index: HashMap<usize, u64>,
}

pub struct RaftState {
    // --- Persistent ---
    pub current_term: u64,
    pub voted_for: Option<usize>,
    pub log: Log,
    pub snapshot: Vec<u8>,

    // --- Volatile, all replicas ---
    pub role: Role,
    pub commit_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<usize>,
    /// Reset to `false` at the start of each election-timeout window; set to `true` whenever a
    /// heartbeat, a valid AppendEntries, or a granted vote arrives.
    pub msg_received: bool,
    pub election_deadline: Instant,
    /// Set whenever a snapshot has been installed (or recovered) but not yet handed to the
    /// applier task as an `ApplyMsg::Snapshot`. The applier is the only thing that ever sends on
    /// the apply channel, so installation just records this and notifies; the applier itself
    /// drains it, keeping a single serialization point (§4.8).
    pub pending_snapshot: Option<(Vec<u8>, u64, u64)>,

    // --- Volatile, leader only ---
    pub leader_state: Option<LeaderState>,
}

impl RaftState {
    pub fn new() -> Self {
        RaftState {
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            snapshot: Vec::new(),
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            msg_received: false,
            election_deadline: Instant::now(),
            pending_snapshot: None,
            leader_state: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Candidate's (or any replica's) log "up-to-date" comparison from the RequestVote rule:
    /// the candidate wins ties on index when terms are equal, and any higher term wins outright.
    pub fn log_is_at_least_as_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        let my_last_term = self.log.last_term();
        let my_last_index = self.log.last_index();
        candidate_last_term > my_last_term
            || (candidate_last_term == my_last_term && candidate_last_index >= my_last_index)
    }

    /// Step down to follower on observing a higher term. Returns the term we had before
    /// stepping down, mirroring the source's `onReceiveHigherTerm` helper.
    pub fn step_down(&mut self, term: u64) -> u64 {
        let previous_term = self.current_term;
        self.current_term = term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.current_leader = None;
        self.leader_state = None;
        previous_term
    }

    pub fn become_candidate(&mut self, me: usize) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(me);
        self.current_leader = None;
    }

    pub fn become_leader(&mut self, me: usize, peer_count: usize) {
        self.role = Role::Leader;
        self.current_leader = Some(me);
        let last_index = self.log.last_index();
        let mut leader = LeaderState::default();
        for peer in 0..peer_count {
            if peer == me {
                continue;
            }
            leader.next_index.insert(peer, last_index + 1);
            leader.match_index.insert(peer, 0);
        }
        self.leader_state = Some(leader);
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
