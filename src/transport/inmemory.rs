//! In-memory transport implementation for testing
//!
//! Routes RPCs over tokio channels so a whole cluster can run inside one
//! test without sockets. An unpumped node behaves like a partitioned one
//! when the transport is configured with a timeout.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RaftCore, RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// Request types that can be sent to a node
pub enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Senders to each node's request channel
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Optional timeout for RPC calls
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    /// Create a transport with senders to all nodes (no timeout)
    pub fn new(senders: HashMap<u64, mpsc::Sender<Request>>) -> Self {
        Self {
            senders,
            timeout: None,
        }
    }

    /// Create a transport with a per-call timeout
    pub fn with_timeout(senders: HashMap<u64, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self {
            senders,
            timeout: Some(timeout),
        }
    }

    async fn deliver<R>(
        &self,
        target: u64,
        make_request: impl FnOnce(oneshot::Sender<R>) -> Request,
    ) -> Result<R, TransportError> {
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make_request(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.deliver(target, |reply| Request::RequestVote { args, reply })
            .await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.deliver(target, |reply| Request::AppendEntries { args, reply })
            .await
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request against an exclusively-owned core.
    /// Returns false once all senders are gone.
    pub async fn process_one(&mut self, node: &mut RaftCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, node);
                true
            }
            None => false,
        }
    }

    /// Process one request against a shared core (for use with RaftServer).
    /// Receives first, then locks only for the handler itself.
    pub async fn process_one_shared(&mut self, node: &SharedCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let mut n = node.lock().await;
                Self::handle_request(request, &mut n);
                true
            }
            None => false,
        }
    }

    fn handle_request(request: Request, node: &mut RaftCore) {
        match request {
            Request::RequestVote { args, reply } => {
                let result = node.handle_request_vote(&args);
                let _ = reply.send(result);
            }
            Request::AppendEntries { args, reply } => {
                let output = node.handle_append_entries(&args);
                let _ = reply.send(output.result);
            }
        }
    }
}

/// Create transports and handles for a cluster of nodes (no timeout)
pub fn create_cluster(
    node_ids: &[u64],
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and handles for a cluster, with an optional per-call
/// timeout so unresponsive nodes register as transport failures
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let mut senders = HashMap::new();
    let mut handles = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(64);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    let mut transports = HashMap::new();
    for &id in node_ids {
        let peer_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&peer_id, _)| peer_id != id)
            .map(|(&peer_id, tx)| (peer_id, tx.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(peer_senders, t),
            None => InMemoryTransport::new(peer_senders),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}
