//! Core Raft state machine (sync, transport-agnostic)
//!
//! Owns the durable facts of one node - term, vote record, log - plus the
//! volatile role/commit bookkeeping, and implements both sides of the two
//! consensus RPCs. Everything here runs under the node's single lock; no
//! network calls are made from this module.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::state_machine::{ApplyResult, StateMachine};
use crate::storage::{Storage, StorageError};

/// Raft node roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    /// Passive state, receives entries from the leader
    Follower,
    /// Actively seeking votes to become leader
    Candidate,
    /// Handles client submissions and replicates the log
    Leader,
}

impl std::fmt::Display for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftState::Follower => write!(f, "follower"),
            RaftState::Candidate => write!(f, "candidate"),
            RaftState::Leader => write!(f, "leader"),
        }
    }
}

/// A single log entry. The command payload is opaque to the consensus core;
/// an empty payload is the no-op a new leader appends on election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was created by a leader
    pub term: u64,
    /// Position in the log (1-indexed, strictly increasing)
    pub index: u64,
    /// Opaque command bytes for the application state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// True for the internal no-op entry a leader appends when elected
    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting the vote
    pub candidate_id: u64,
    /// Index of candidate's last log entry
    pub last_log_index: u64,
    /// Term of candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Receiver's current term, for the candidate to update itself
    pub term: u64,
    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: u64,
    /// Term of the entry at prev_log_index
    pub prev_log_term: u64,
    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: u64,
}

/// AppendEntries RPC reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Receiver's current term, for the leader to update itself
    pub term: u64,
    /// True if the follower matched prev_log_index/prev_log_term
    pub success: bool,
}

/// Result of handling an AppendEntries RPC
#[derive(Debug, Clone)]
pub struct HandleAppendEntriesOutput {
    /// The reply to send back to the leader
    pub result: AppendEntriesResult,
    /// Leader ID if the sender was accepted as a valid leader
    pub leader_id: Option<u64>,
}

/// Core Raft state for one node.
///
/// Persistent state (term, vote, log) is cached in memory and written
/// through to the storage backend before any RPC reply that depends on it.
/// A storage write failure is fatal: the node cannot keep promises it could
/// not record, so persistence helpers panic and take the process down.
pub struct RaftCore {
    storage: Box<dyn Storage>,
    state_machine: Box<dyn StateMachine>,

    // Persistent state on all servers
    /// Latest term this node has seen (starts at 0, increases monotonically)
    pub current_term: u64,
    /// Candidate that received this node's vote in the current term
    pub voted_for: Option<u64>,
    /// Log entries; first index is 1
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    /// Highest log index known to be committed (increases monotonically)
    pub commit_index: u64,
    /// Highest log index delivered to the state machine
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    /// For each peer, the next log index to send
    pub next_index: HashMap<u64, u64>,
    /// For each peer, the highest log index known replicated there
    pub match_index: HashMap<u64, u64>,

    /// This node's ID
    pub id: u64,
    /// Current role
    pub state: RaftState,
    /// IDs of the other nodes in the fixed cluster
    pub peers: Vec<u64>,
    /// Peers that granted a vote in the current election
    votes_received: Vec<u64>,
    /// Term this node last started an election in; vote replies for any
    /// other term are discarded
    election_term: u64,
    /// Best-known current leader, for client redirects
    pub current_leader: Option<u64>,
    /// Last time a valid leader or granted candidate reset the election timer
    pub last_heartbeat: Instant,
}

impl RaftCore {
    /// Create a new core, loading persistent state from the storage backend.
    /// A fresh node starts at term 0 with no vote and an empty log.
    pub fn new(
        id: u64,
        peers: Vec<u64>,
        storage: Box<dyn Storage>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self, StorageError> {
        let current_term = storage.load_term()?;
        let voted_for = storage.load_voted_for()?;
        let log = storage.load_log()?;

        Ok(RaftCore {
            storage,
            state_machine,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            state: RaftState::Follower,
            peers,
            votes_received: Vec::new(),
            election_term: 0,
            current_leader: None,
            last_heartbeat: Instant::now(),
        })
    }

    // === Persistence helpers ===
    // Term, vote, and log writes must be durable before the RPC reply that
    // depends on them goes out. Failure here is fatal for the node.

    fn set_term(&mut self, term: u64) {
        self.current_term = term;
        self.storage.save_term(term).expect("failed to persist term");
    }

    fn set_voted_for(&mut self, voted_for: Option<u64>) {
        self.voted_for = voted_for;
        self.storage
            .save_voted_for(voted_for)
            .expect("failed to persist vote");
    }

    /// Adopt a higher term, clearing the vote for the new term
    fn update_term(&mut self, new_term: u64) {
        self.set_term(new_term);
        self.set_voted_for(None);
    }

    fn persist_log_entry(&mut self, entry: LogEntry) {
        self.storage
            .append_log_entries(std::slice::from_ref(&entry))
            .expect("failed to persist log entry");
        self.log.push(entry);
    }

    fn persist_truncate_log(&mut self, from_index: u64) {
        let truncate_pos = (from_index - 1) as usize;
        if truncate_pos < self.log.len() {
            self.storage
                .truncate_log(from_index)
                .expect("failed to truncate log");
            self.log.truncate(truncate_pos);
        }
    }

    /// Step down to follower because a higher term was observed
    fn step_down(&mut self, new_term: u64) {
        let old_state = self.state;
        self.update_term(new_term);
        self.state = RaftState::Follower;
        if old_state != RaftState::Follower {
            info!(node = self.id, was = %old_state, term = new_term, "stepped down to follower");
        }
    }

    // === Log accessors ===

    /// Index of the last log entry (0 when the log is empty)
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last log entry (0 when the log is empty)
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Entry at a 1-based index
    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Check if a candidate's log is at least as up to date as ours:
    /// compare (last term, last index) lexicographically, candidate wins ties
    pub fn is_log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= my_last_index)
    }

    // === RPC handlers (inbound) ===

    /// Handle a RequestVote RPC
    pub fn handle_request_vote(&mut self, req: &RequestVoteArgs) -> RequestVoteResult {
        // Decline stale terms immediately
        if req.term < self.current_term {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        if req.term > self.current_term {
            self.step_down(req.term);
        }

        // One vote per term: decline if already committed to another candidate
        if self.voted_for.is_some() && self.voted_for != Some(req.candidate_id) {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        if !self.is_log_up_to_date(req.last_log_term, req.last_log_index) {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        // Grant: persist the vote before replying, and reset the election
        // timer so this node does not immediately challenge its own grantee
        self.set_voted_for(Some(req.candidate_id));
        self.last_heartbeat = Instant::now();
        debug!(node = self.id, candidate = req.candidate_id, term = self.current_term, "vote granted");

        RequestVoteResult {
            term: self.current_term,
            vote_granted: true,
        }
    }

    /// Handle an AppendEntries RPC (heartbeat or replication)
    pub fn handle_append_entries(&mut self, req: &AppendEntriesArgs) -> HandleAppendEntriesOutput {
        if req.term > self.current_term {
            self.step_down(req.term);
        }

        // Stale leader: reject without touching the election timer
        if req.term < self.current_term {
            return HandleAppendEntriesOutput {
                result: AppendEntriesResult {
                    term: self.current_term,
                    success: false,
                },
                leader_id: None,
            };
        }

        // Valid leader for the current term: follow it and reset the
        // election timer. This holds even when the consistency check below
        // fails - the leader is legitimate, the logs just don't match yet.
        if self.state != RaftState::Follower {
            info!(node = self.id, leader = req.leader_id, term = req.term, "yielding to leader");
        }
        self.state = RaftState::Follower;
        self.current_leader = Some(req.leader_id);
        self.last_heartbeat = Instant::now();

        // Consistency check: our log must contain the entry the new batch
        // is anchored to
        let consistent = req.prev_log_index == 0
            || self
                .entry_at(req.prev_log_index)
                .map(|e| e.term == req.prev_log_term)
                .unwrap_or(false);

        let success = if consistent {
            self.reconcile_entries(&req.entries);

            // commit_index = min(leader_commit, last new entry), never backwards
            if req.leader_commit > self.commit_index {
                self.commit_index = std::cmp::min(req.leader_commit, self.last_log_index());
                self.apply_committed_entries();
            }
            true
        } else {
            false
        };

        HandleAppendEntriesOutput {
            result: AppendEntriesResult {
                term: self.current_term,
                success,
            },
            leader_id: Some(req.leader_id),
        }
    }

    /// Merge a batch from the leader into the local log: replays of entries
    /// we already hold are skipped, a conflicting entry truncates the log
    /// from that index before the new suffix is appended.
    fn reconcile_entries(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            let pos = (entry.index - 1) as usize;
            if let Some(existing) = self.log.get(pos) {
                if existing.term == entry.term {
                    // Same (index, term): identical by the log matching
                    // property, nothing to do
                    continue;
                }
                self.persist_truncate_log(entry.index);
            }
            debug!(node = self.id, index = entry.index, term = entry.term, "replicated entry");
            self.persist_log_entry(entry.clone());
        }
    }

    // === Elections ===

    /// Enter candidacy: bump the term, vote for self, snapshot the election
    /// term for vote counting, reset the election timer
    pub fn start_election(&mut self) {
        self.set_term(self.current_term + 1);
        self.state = RaftState::Candidate;
        self.current_leader = None;
        self.set_voted_for(Some(self.id));
        self.election_term = self.current_term;
        self.votes_received.clear();
        self.votes_received.push(self.id);
        self.last_heartbeat = Instant::now();
        info!(node = self.id, term = self.current_term, "became candidate");
    }

    /// The term of the election currently being run (for tagging vote requests)
    pub fn election_term(&self) -> u64 {
        self.election_term
    }

    /// Become leader after winning an election. Reinitializes per-peer
    /// replication state and appends a no-op entry at the new term so that
    /// entries from previous terms can commit indirectly.
    pub fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        self.last_heartbeat = Instant::now();
        info!(node = self.id, term = self.current_term, "became leader");

        let last_index = self.last_log_index();
        for peer_id in &self.peers {
            self.next_index.insert(*peer_id, last_index + 1);
            self.match_index.insert(*peer_id, 0);
        }

        let noop = LogEntry {
            term: self.current_term,
            index: last_index + 1,
            command: Vec::new(),
        };
        self.persist_log_entry(noop);
    }

    /// Handle one vote reply. Replies for any term other than the election
    /// this node is running are discarded. Returns true if this node just
    /// became leader.
    pub fn handle_request_vote_result(
        &mut self,
        peer_id: u64,
        election_term: u64,
        result: &RequestVoteResult,
    ) -> bool {
        if result.term > self.current_term {
            self.step_down(result.term);
            return false;
        }

        // Only count replies for the election we are still running
        if self.state != RaftState::Candidate || self.current_term != election_term {
            return false;
        }

        if result.vote_granted
            && result.term == election_term
            && !self.votes_received.contains(&peer_id)
        {
            self.votes_received.push(peer_id);
            debug!(node = self.id, from = peer_id, votes = self.votes_received.len(), "vote received");
        }

        let total_nodes = 1 + self.peers.len();
        let majority = total_nodes / 2 + 1;
        if self.votes_received.len() >= majority {
            self.become_leader();
            return true;
        }

        false
    }

    // === Leader-side replication bookkeeping ===

    /// Append a client command to the local log. Returns None on a non-leader.
    pub fn append_command(&mut self, command: Vec<u8>) -> Option<LogEntry> {
        if self.state != RaftState::Leader {
            return None;
        }

        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            command,
        };
        debug!(node = self.id, index = entry.index, term = entry.term, "appended command");
        self.persist_log_entry(entry.clone());
        Some(entry)
    }

    /// Ask the state machine whether it would accept this command, without
    /// spending a log slot on a submission it is bound to reject
    pub fn validate_command(&self, command: &[u8]) -> Result<(), String> {
        self.state_machine.validate(command)
    }

    /// Handle one AppendEntries reply from a peer. `sent_up_to` is the index
    /// of the last entry carried by the request (the prev index for a pure
    /// heartbeat). Returns the apply results of any entries this reply
    /// newly committed.
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: u64,
        sent_up_to: u64,
        result: &AppendEntriesResult,
    ) -> Vec<(u64, ApplyResult)> {
        if result.term > self.current_term {
            self.step_down(result.term);
            return Vec::new();
        }

        // A reply tagged with an older term answers a request from a
        // leadership this node no longer holds; it must not mutate anything
        if self.state != RaftState::Leader || result.term < self.current_term {
            return Vec::new();
        }

        if result.success {
            if sent_up_to > 0 {
                let matched = self.match_index.entry(peer_id).or_insert(0);
                if sent_up_to > *matched {
                    *matched = sent_up_to;
                }
                self.next_index.insert(peer_id, sent_up_to + 1);
            }
            self.advance_commit_index()
        } else {
            // Consistency mismatch: back nextIndex off and let the next
            // round probe one entry earlier
            let next = self.next_index.get(&peer_id).copied().unwrap_or(1);
            if next > 1 {
                self.next_index.insert(peer_id, next - 1);
            }
            Vec::new()
        }
    }

    /// Advance commit_index to the highest index replicated on a strict
    /// majority (this node included) whose entry was appended in the current
    /// term, then apply everything newly committed. Entries from earlier
    /// terms commit only indirectly through a current-term entry above them.
    fn advance_commit_index(&mut self) -> Vec<(u64, ApplyResult)> {
        let mut matches: Vec<u64> = self.match_index.values().copied().collect();
        matches.push(self.last_log_index());
        matches.sort_unstable();

        let total_nodes = matches.len();
        let majority = total_nodes / 2 + 1;
        // After sorting, this position holds the highest index that a
        // majority of nodes have reached
        let candidate = matches[total_nodes - majority];

        if candidate > self.commit_index
            && self.entry_at(candidate).map(|e| e.term) == Some(self.current_term)
        {
            self.commit_index = candidate;
            debug!(node = self.id, commit_index = candidate, "advanced commit index");
            return self.apply_committed_entries();
        }

        Vec::new()
    }

    /// Deliver committed-but-unapplied entries to the state machine in index
    /// order, exactly once each, advancing last_applied in lockstep.
    pub fn apply_committed_entries(&mut self) -> Vec<(u64, ApplyResult)> {
        let mut results = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self
                .entry_at(self.last_applied)
                .cloned()
                .unwrap_or_else(|| {
                    panic!(
                        "node {}: committed entry {} missing from log",
                        self.id, self.last_applied
                    )
                });
            let result = self.state_machine.apply(&entry.command);
            results.push((self.last_applied, result));
        }
        results
    }
}
