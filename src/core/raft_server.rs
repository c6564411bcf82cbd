//! RaftServer - the per-node event loop and client submission surface
//!
//! One task owns the timers: a heartbeat interval that drives leader-side
//! replication rounds, and a randomized election deadline recomputed from
//! the core's last-heartbeat timestamp on every pass. Client submissions
//! arrive over a channel and are serviced inside the same loop, so all
//! leader-side activity is serialized.

use std::pin::pin;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::info;

use super::config::RaftConfig;
use super::raft_core::{RaftCore, RaftState};
use super::raft_node::{RaftNode, SharedCore};
use crate::transport::Transport;

/// Errors surfaced to clients of the consensus core
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// This node is not the leader; the hint names the best-known leader
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },
    /// The state machine refused the command before it was appended
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    /// The state machine reported an error applying the committed command
    #[error("state machine error: {0}")]
    StateMachine(String),
    /// Leadership was lost while awaiting commit; the entry may or may not
    /// commit under a future leader
    #[error("leadership lost while awaiting commit; outcome unknown")]
    Indeterminate,
    /// The entry did not commit before the submission deadline; outcome
    /// unknown until a majority is reachable again
    #[error("commit not reached before deadline; outcome unknown")]
    CommitTimeout,
    /// The server loop is no longer running
    #[error("consensus server unavailable")]
    Unavailable,
}

/// Commands sent to the server loop from client handles
enum Command {
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, RaftError>>,
    },
}

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    /// Submit a command for replication. Resolves with the state machine's
    /// result once the entry is committed and applied on this node, or with
    /// an error describing why that could not be confirmed.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Vec<u8>, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Submit {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::Unavailable)?;

        reply_rx.await.map_err(|_| RaftError::Unavailable)?
    }

    /// Shut the server loop down gracefully
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Raft server: owns the node, its timers, and the client command channel
pub struct RaftServer<T: Transport> {
    pub(crate) node: RaftNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    config: RaftConfig,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a server with the default timing config.
    /// Returns the server and the shared core for inbound RPC handling.
    pub fn new(core: RaftCore, transport: T) -> (Self, SharedCore) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a server with a custom timing config
    pub fn with_config(core: RaftCore, transport: T, config: RaftConfig) -> (Self, SharedCore) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = RaftNode::new(core, transport);
        let shared_core = node.shared_core();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            config,
        };
        (server, shared_core)
    }

    /// Spawn the event loop and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main event loop
    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        // Delay keeps a burst of missed ticks from starving the other arms
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut election_timeout = self.config.random_election_timeout();

        loop {
            let election_deadline = self.election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("consensus server shutting down");
                    break;
                }
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        Command::Submit { command, reply } => {
                            let result = self.handle_submit(command).await;
                            let _ = reply.send(result);
                        }
                    }
                }
                // Leader-side replication pulse; an empty round is the heartbeat
                _ = heartbeat.tick() => {
                    if self.node.state().await == RaftState::Leader {
                        // Keep the leader's own election timer from firing
                        self.node.shared_core().lock().await.last_heartbeat = Instant::now();
                        self.node.heartbeat_round().await;
                    }
                }
                // Election timeout for followers and candidates
                _ = election_sleep => {
                    let state = self.node.state().await;
                    if state != RaftState::Leader && self.election_timed_out(election_timeout).await {
                        self.node.start_election().await;
                        let became_leader = self.node.request_votes().await;
                        if became_leader {
                            // Establish leadership before any follower times out
                            self.node.heartbeat_round().await;
                        }
                        // Fresh randomized timeout for the next round breaks
                        // repeated split votes
                        election_timeout = self.config.random_election_timeout();
                    }
                }
                else => break,
            }
        }
    }

    /// Election deadline derived from the core's last heartbeat
    async fn election_deadline(&self, timeout: Duration) -> Instant {
        let core = self.node.shared_core();
        let last_heartbeat = core.lock().await.last_heartbeat;
        last_heartbeat + timeout
    }

    /// Re-check the deadline at fire time; a heartbeat may have landed
    /// while the sleep was pending
    async fn election_timed_out(&self, timeout: Duration) -> bool {
        let core = self.node.shared_core();
        let last_heartbeat = core.lock().await.last_heartbeat;
        Instant::now() >= last_heartbeat + timeout
    }

    /// Append a client command and drive replication until it commits, the
    /// submission deadline passes, or leadership is lost.
    async fn handle_submit(&self, command: Vec<u8>) -> Result<Vec<u8>, RaftError> {
        let shared_core = self.node.shared_core();
        let (entry_index, entry_term) = {
            let mut core = shared_core.lock().await;

            if core.state != RaftState::Leader {
                return Err(RaftError::NotLeader {
                    leader_hint: core.current_leader,
                });
            }

            core.validate_command(&command)
                .map_err(RaftError::InvalidCommand)?;

            let entry = core
                .append_command(command)
                .ok_or(RaftError::NotLeader { leader_hint: None })?;
            (entry.index, entry.term)
        };

        let deadline = Instant::now() + self.config.submit_timeout;
        loop {
            // Replication rounds double as heartbeats, so followers stay
            // quiet while a submission is in flight
            if let Some(result) = self.node.replicate_until(entry_index).await {
                return result.map_err(RaftError::StateMachine);
            }

            {
                let core = shared_core.lock().await;
                if core.state != RaftState::Leader || core.current_term != entry_term {
                    return Err(RaftError::Indeterminate);
                }
            }

            if Instant::now() >= deadline {
                return Err(RaftError::CommitTimeout);
            }

            tokio::time::sleep(self.config.heartbeat_interval).await;
        }
    }

    /// Start an election (delegates to the node; used by tests)
    pub async fn start_election(&self) {
        self.node.start_election().await;
    }

    /// Request votes from all peers (delegates to the node; used by tests)
    pub async fn request_votes(&self) -> bool {
        self.node.request_votes().await
    }

    /// Current role
    pub async fn state(&self) -> RaftState {
        self.node.state().await
    }

    /// Current commit index
    pub async fn commit_index(&self) -> u64 {
        self.node.commit_index().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::Mutex;

    use crate::state_machine::{AppliedCommands, TestStateMachine};
    use crate::storage::memory::MemoryStorage;
    use crate::transport::inmemory::create_cluster_with_timeout;

    fn new_test_core(id: u64, peers: Vec<u64>) -> RaftCore {
        RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(TestStateMachine::new()),
        )
        .unwrap()
    }

    fn new_test_core_with_shared(id: u64, peers: Vec<u64>, applied: AppliedCommands) -> RaftCore {
        RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(TestStateMachine::new_shared(applied)),
        )
        .unwrap()
    }

    fn fast_config() -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_election_timeout(Duration::from_millis(100), Duration::from_millis(200))
            .with_rpc_timeout(Duration::from_millis(15))
            .with_submit_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_submit_on_non_leader_reports_hint() {
        let node_ids = vec![1, 2, 3];
        let (mut transports, _handles) =
            create_cluster_with_timeout(&node_ids, Some(Duration::from_millis(15)));

        let mut core = new_test_core(1, vec![2, 3]);
        core.current_leader = Some(3);
        let (server, _shared) =
            RaftServer::with_config(core, transports.remove(&1).unwrap(), fast_config());
        let handle = server.start();

        let result = handle.submit(b"cmd".to_vec()).await;
        match result {
            Err(RaftError::NotLeader { leader_hint }) => assert_eq!(leader_hint, Some(3)),
            other => panic!("expected NotLeader, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_election_and_submit_via_server() {
        let node_ids = vec![1, 2, 3];
        let (mut transports, mut handles) = create_cluster_with_timeout(&node_ids, None);

        let applied = Arc::new(StdMutex::new(Vec::new()));
        let core1 = new_test_core_with_shared(1, vec![2, 3], applied.clone());
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));
        let shared3 = Arc::new(Mutex::new(new_test_core(3, vec![1, 2])));

        let (server1, _shared1) =
            RaftServer::with_config(core1, transports.remove(&1).unwrap(), fast_config());

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        // Win the election
        server1.start_election().await;
        let (became_leader, _, _) = tokio::join!(
            server1.request_votes(),
            handle2.process_one_shared(&shared2),
            handle3.process_one_shared(&shared3),
        );
        assert!(became_leader);
        assert_eq!(server1.state().await, RaftState::Leader);

        // Pump follower requests in the background while the server loop runs
        let pump2 = tokio::spawn(async move {
            while handle2.process_one_shared(&shared2).await {}
        });
        let pump3 = tokio::spawn(async move {
            while handle3.process_one_shared(&shared3).await {}
        });

        let raft_handle = server1.start();
        let result = raft_handle.submit(b"cmd".to_vec()).await;
        assert!(result.is_ok());

        // The leader applied the no-op and the command in order
        let applied = applied.lock().unwrap().clone();
        assert_eq!(applied, vec![Vec::new(), b"cmd".to_vec()]);

        raft_handle.shutdown().await;
        pump2.abort();
        pump3.abort();
    }

    #[tokio::test]
    async fn test_submit_without_majority_times_out() {
        let node_ids = vec![1, 2, 3];
        // Peers exist but nothing pumps their channels: every call times out
        let (mut transports, _handles) =
            create_cluster_with_timeout(&node_ids, Some(Duration::from_millis(15)));

        let mut core = new_test_core(1, vec![2, 3]);
        // Force leadership without contacting peers
        core.start_election();
        core.become_leader();

        let (server, _shared) =
            RaftServer::with_config(core, transports.remove(&1).unwrap(), fast_config());
        let handle = server.start();

        let result = handle.submit(b"cmd".to_vec()).await;
        match result {
            Err(RaftError::CommitTimeout) | Err(RaftError::Indeterminate) => {}
            other => panic!("expected timeout or indeterminate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cluster_elects_single_leader() {
        let node_ids = vec![1u64, 2, 3];
        let (mut transports, mut node_handles) =
            create_cluster_with_timeout(&node_ids, Some(Duration::from_millis(15)));

        let mut raft_handles = Vec::new();
        let mut cores = Vec::new();

        for &id in &node_ids {
            let peers: Vec<u64> = node_ids.iter().copied().filter(|&p| p != id).collect();
            let core = new_test_core(id, peers);
            let (server, shared) =
                RaftServer::with_config(core, transports.remove(&id).unwrap(), fast_config());
            let mut node_handle = node_handles.remove(&id).unwrap();
            let pump_core = shared.clone();
            tokio::spawn(async move {
                while node_handle.process_one_shared(&pump_core).await {}
            });
            raft_handles.push(server.start());
            cores.push(shared);
        }

        // Give the cluster a few election timeouts to settle
        tokio::time::sleep(Duration::from_millis(800)).await;

        let mut leaders = Vec::new();
        let mut terms = Vec::new();
        for shared in &cores {
            let core = shared.lock().await;
            if core.state == RaftState::Leader {
                leaders.push(core.id);
            }
            terms.push(core.current_term);
        }
        assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);

        // Followers agree on the leader hint
        let leader_id = leaders[0];
        for shared in &cores {
            let core = shared.lock().await;
            if core.id != leader_id {
                assert_eq!(core.current_leader, Some(leader_id));
            }
        }

        for handle in &raft_handles {
            handle.shutdown().await;
        }
    }
}
