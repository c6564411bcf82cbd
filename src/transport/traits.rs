//! Transport abstraction for Raft RPC communication

use async_trait::async_trait;
use thiserror::Error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};

/// Outbound RPC channel to the peer set. One logical client, callable
/// concurrently from the election and replication drivers; every call is
/// bounded by the transport's own timeout.
///
/// A transport failure is a distinct outcome from a protocol-level negative
/// reply: the former is retried by the next scheduled round, the latter is
/// consensus information.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection to the target node failed
    #[error("connection failed")]
    ConnectionFailed,
    /// The call did not complete within the transport's timeout
    #[error("request timed out")]
    Timeout,
    /// The target node is not in the configured peer set
    #[error("unknown peer")]
    NodeNotFound,
}
