//! RaftNode - drives elections and replication over a Transport
//!
//! The node snapshots request parameters under the core lock, releases it,
//! fans the calls out to all peers concurrently, and re-acquires the lock
//! briefly per response. No outbound call ever holds the lock, so a slow
//! peer cannot block inbound RPC handling.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::raft_core::{AppendEntriesArgs, RaftCore, RaftState, RequestVoteArgs};
use crate::state_machine::ApplyResult;
use crate::transport::Transport;

/// Shared reference to the core; RPC handlers and drivers serialize on it
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// High-level Raft node that runs the consensus protocols against peers
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
}

impl<T: Transport> RaftNode<T> {
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
        }
    }

    /// Shared core handle for inbound RPC handling
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Enter candidacy for a new term
    pub async fn start_election(&self) {
        let mut core = self.core.lock().await;
        core.start_election();
    }

    /// Request votes from every peer concurrently. Replies are counted
    /// against the term the election started in; stale replies are dropped
    /// inside the core. Returns true if this node became leader.
    pub async fn request_votes(&self) -> bool {
        let (args, peers, election_term) = {
            let core = self.core.lock().await;
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.id,
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (args, core.peers.clone(), core.election_term())
        };

        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    if core.handle_request_vote_result(peer_id, election_term, &result) {
                        return true; // majority reached, don't wait for stragglers
                    }
                }
                Err(err) => {
                    debug!(peer = peer_id, error = %err, "vote request failed");
                }
            }
        }

        false
    }

    /// Build one AppendEntries request per peer, carrying everything from
    /// that peer's next_index to the end of the log (empty when caught up).
    /// Returns (peer, args, sent_up_to) where sent_up_to is the last index
    /// the request accounts for on the peer.
    fn build_append_requests(core: &RaftCore) -> Vec<(u64, AppendEntriesArgs, u64)> {
        let mut requests = Vec::new();
        for &peer_id in &core.peers {
            let next_idx = core.next_index.get(&peer_id).copied().unwrap_or(1);
            let prev_log_index = next_idx - 1;
            let prev_log_term = core
                .entry_at(prev_log_index)
                .map(|e| e.term)
                .unwrap_or(0);

            let entries: Vec<_> = core
                .log
                .iter()
                .filter(|e| e.index >= next_idx)
                .cloned()
                .collect();
            let sent_up_to = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

            let args = AppendEntriesArgs {
                term: core.current_term,
                leader_id: core.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: core.commit_index,
            };
            requests.push((peer_id, args, sent_up_to));
        }
        requests
    }

    /// One full replication round: send AppendEntries to every peer (an
    /// empty batch doubles as the heartbeat), process every reply. Returns
    /// whether this node is still leader afterwards.
    pub async fn heartbeat_round(&self) -> bool {
        let requests = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return false;
            }
            Self::build_append_requests(&core)
        };

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args, sent_up_to)| {
                let transport = &self.transport;
                async move {
                    (
                        peer_id,
                        sent_up_to,
                        transport.append_entries(peer_id, args).await,
                    )
                }
            })
            .collect();

        // Wait for every peer so higher terms are observed and slow
        // followers still catch up within the round
        while let Some((peer_id, sent_up_to, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    let _ = core.handle_append_entries_result(peer_id, sent_up_to, &result);
                }
                Err(err) => {
                    debug!(peer = peer_id, error = %err, "append entries failed");
                }
            }
        }

        self.core.lock().await.state == RaftState::Leader
    }

    /// Replication round that watches for a specific entry to commit.
    /// Returns the state machine's apply result for `entry_index` as soon
    /// as a majority acknowledgment commits it, or None if this round did
    /// not commit it (caller retries on the next round).
    pub async fn replicate_until(&self, entry_index: u64) -> Option<ApplyResult> {
        let requests = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return None;
            }
            Self::build_append_requests(&core)
        };

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args, sent_up_to)| {
                let transport = &self.transport;
                async move {
                    (
                        peer_id,
                        sent_up_to,
                        transport.append_entries(peer_id, args).await,
                    )
                }
            })
            .collect();

        let mut entry_result = None;
        while let Some((peer_id, sent_up_to, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    let applied = core.handle_append_entries_result(peer_id, sent_up_to, &result);
                    for (idx, res) in applied {
                        if idx == entry_index {
                            entry_result = Some(res);
                        }
                    }
                }
                Err(err) => {
                    debug!(peer = peer_id, error = %err, "append entries failed");
                }
            }
            if entry_result.is_some() {
                break; // committed, don't wait for the remaining peers
            }
        }
        entry_result
    }

    /// Current role
    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Current commit index
    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }
}
