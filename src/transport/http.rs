//! HTTP transport implementation for Raft RPC
//!
//! axum serves the inbound side, reqwest drives the outbound side. Bodies
//! are JSON; the per-call timeout lives on the reqwest client so a slow or
//! partitioned peer surfaces as `TransportError::Timeout`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// HTTP transport for Raft RPC communication
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:8001")
    peers: HashMap<u64, String>,
    /// HTTP client with a per-call timeout
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create an HTTP transport with peer addresses and a per-call timeout
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| TransportError::ConnectionFailed)?;

        Ok(HttpTransport { peers, client })
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::ConnectionFailed
        }
    }

    async fn post_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        target: u64,
        path: &str,
        args: &Req,
    ) -> Result<Resp, TransportError> {
        let addr = self
            .peers
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}{}", addr, path);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(Self::classify)?;

        response
            .json::<Resp>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post_json(target, "/raft/request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post_json(target, "/raft/append_entries", &args).await
    }
}

/// Create an axum router serving the inbound Raft RPC surface
pub fn create_router(core: SharedCore) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .with_state(core)
}

async fn handle_request_vote(
    State(core): State<SharedCore>,
    Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteResult> {
    let mut core = core.lock().await;
    Json(core.handle_request_vote(&args))
}

async fn handle_append_entries(
    State(core): State<SharedCore>,
    Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesResult> {
    let mut core = core.lock().await;
    Json(core.handle_append_entries(&args).result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    use crate::core::raft_core::{LogEntry, RaftCore};
    use crate::state_machine::TestStateMachine;
    use crate::storage::memory::MemoryStorage;

    fn new_test_core(id: u64, peers: Vec<u64>) -> RaftCore {
        RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(TestStateMachine::new()),
        )
        .unwrap()
    }

    async fn serve_node(core: SharedCore) -> String {
        let router = create_router(core);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_http_request_vote() {
        let core2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));
        let addr = serve_node(core2.clone()).await;

        let mut peers = HashMap::new();
        peers.insert(2, addr);
        let transport = HttpTransport::new(peers, Duration::from_secs(2)).unwrap();

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let result = transport.request_vote(2, args).await.unwrap();
        assert!(result.vote_granted);
        assert_eq!(core2.lock().await.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_http_append_entries() {
        let core2 = Arc::new(Mutex::new(new_test_core(2, vec![1, 3])));
        let addr = serve_node(core2.clone()).await;

        let mut peers = HashMap::new();
        peers.insert(2, addr);
        let transport = HttpTransport::new(peers, Duration::from_secs(2)).unwrap();

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry {
                term: 1,
                index: 1,
                command: b"cmd".to_vec(),
            }],
            leader_commit: 0,
        };

        let result = transport.append_entries(2, args).await.unwrap();
        assert!(result.success);
        let core = core2.lock().await;
        assert_eq!(core.log.len(), 1);
        assert_eq!(core.current_leader, Some(1));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_a_transport_failure() {
        let mut peers = HashMap::new();
        // Nothing listens here
        peers.insert(2, "127.0.0.1:1".to_string());
        let transport = HttpTransport::new(peers, Duration::from_millis(200)).unwrap();

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let result = transport.request_vote(2, args).await;
        assert!(result.is_err());
    }
}
