//! HTTP client API for the Raft cluster
//!
//! Endpoints for external clients:
//! - submit commands to the leader
//! - query cluster status and leader information
//!
//! Redirecting a rejected submission to the hinted leader is the caller's
//! responsibility; this layer only reports the hint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftError, RaftHandle};
use crate::state_machine::kv::SharedKvStore;

/// State for client handlers: the handle submits through the full consensus
/// flow, the core answers status queries
#[derive(Clone)]
pub struct ClientState {
    pub handle: RaftHandle,
    pub core: SharedCore,
}

/// Request body for submitting a command. The command is an arbitrary JSON
/// value; its serialized bytes are what the cluster replicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub command: serde_json::Value,
}

/// Response from a successful submit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// State machine output, decoded as UTF-8
    pub result: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Leader hint (node ID) if known, for redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<u64>,
}

/// Response for leader query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader_id: Option<u64>,
    pub node_id: u64,
    pub is_leader: bool,
}

/// Response for status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: u64,
    pub state: String,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_length: u64,
}

/// Response for a direct key read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub key: String,
    pub value: String,
}

/// Router answering only status/leader queries (no submission path)
pub fn create_client_router(core: SharedCore) -> Router {
    Router::new()
        .route("/client/leader", get(handle_leader_core))
        .route("/client/status", get(handle_status_core))
        .with_state(core)
}

/// Router with the full submission flow wired in
pub fn create_client_router_full(handle: RaftHandle, core: SharedCore) -> Router {
    let state = ClientState { handle, core };
    Router::new()
        .route("/client/submit", post(handle_submit))
        .route("/client/leader", get(handle_leader))
        .route("/client/status", get(handle_status))
        .with_state(state)
}

/// Full router plus direct reads against a shared key-value store
pub fn create_client_router_with_reads(
    handle: RaftHandle,
    core: SharedCore,
    kv: SharedKvStore,
) -> Router {
    create_client_router_full(handle, core).merge(
        Router::new()
            .route("/client/get/{key}", get(handle_get))
            .with_state(kv),
    )
}

/// POST /client/submit - replicate a command through the cluster
async fn handle_submit(
    State(state): State<ClientState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    let payload = serde_json::to_vec(&request.command).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("unserializable command: {}", e),
                leader_hint: None,
            }),
        )
    })?;

    match state.handle.submit(payload).await {
        Ok(result) => Ok(Json(SubmitResponse {
            result: String::from_utf8_lossy(&result).into_owned(),
        })),
        Err(err) => Err(error_response(err)),
    }
}

fn error_response(err: RaftError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, leader_hint) = match &err {
        RaftError::NotLeader { leader_hint } => (StatusCode::SERVICE_UNAVAILABLE, *leader_hint),
        RaftError::InvalidCommand(_) | RaftError::StateMachine(_) => {
            (StatusCode::BAD_REQUEST, None)
        }
        RaftError::Indeterminate | RaftError::CommitTimeout => {
            (StatusCode::GATEWAY_TIMEOUT, None)
        }
        RaftError::Unavailable => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            leader_hint,
        }),
    )
}

/// GET /client/leader
async fn handle_leader(State(state): State<ClientState>) -> Json<LeaderResponse> {
    leader_response(&state.core).await
}

async fn handle_leader_core(State(core): State<SharedCore>) -> Json<LeaderResponse> {
    leader_response(&core).await
}

async fn leader_response(core: &SharedCore) -> Json<LeaderResponse> {
    let core = core.lock().await;
    Json(LeaderResponse {
        leader_id: core.current_leader,
        node_id: core.id,
        is_leader: core.state == crate::core::raft_core::RaftState::Leader,
    })
}

/// GET /client/status
async fn handle_status(State(state): State<ClientState>) -> Json<StatusResponse> {
    status_response(&state.core).await
}

async fn handle_status_core(State(core): State<SharedCore>) -> Json<StatusResponse> {
    status_response(&core).await
}

async fn status_response(core: &SharedCore) -> Json<StatusResponse> {
    let core = core.lock().await;
    Json(StatusResponse {
        node_id: core.id,
        state: core.state.to_string(),
        term: core.current_term,
        leader_id: core.current_leader,
        commit_index: core.commit_index,
        last_applied: core.last_applied,
        log_length: core.log.len() as u64,
    })
}

/// GET /client/get/{key} - direct read against the local state machine
async fn handle_get(
    State(kv): State<SharedKvStore>,
    Path(key): Path<String>,
) -> Result<Json<ReadResponse>, StatusCode> {
    let value = kv.lock().unwrap().get(&key);
    match value {
        Some(value) => Ok(Json(ReadResponse { key, value })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::core::config::RaftConfig;
    use crate::core::raft_core::RaftCore;
    use crate::core::raft_server::RaftServer;
    use crate::state_machine::kv::KeyValueStore;
    use crate::storage::memory::MemoryStorage;
    use crate::transport::inmemory::create_cluster_with_timeout;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn follower_node() -> (RaftServer<crate::transport::inmemory::InMemoryTransport>, SharedCore, SharedKvStore)
    {
        let (mut transports, _handles) =
            create_cluster_with_timeout(&[1, 2, 3], Some(Duration::from_millis(15)));
        let kv: SharedKvStore = Arc::new(StdMutex::new(KeyValueStore::new()));
        let mut core = RaftCore::new(
            1,
            vec![2, 3],
            Box::new(MemoryStorage::new()),
            Box::new(kv.clone()),
        )
        .unwrap();
        core.current_leader = Some(2);
        let config = RaftConfig::default()
            .with_election_timeout(Duration::from_secs(30), Duration::from_secs(60));
        let (server, shared) =
            RaftServer::with_config(core, transports.remove(&1).unwrap(), config);
        (server, shared, kv)
    }

    #[tokio::test]
    async fn test_status_and_leader_endpoints() {
        let (server, shared, kv) = follower_node();
        let handle = server.start();
        let base = serve(create_client_router_with_reads(handle, shared, kv)).await;

        let status: StatusResponse = reqwest::get(format!("{}/client/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.node_id, 1);
        assert_eq!(status.state, "follower");
        assert_eq!(status.leader_id, Some(2));

        let leader: LeaderResponse = reqwest::get(format!("{}/client/leader", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(leader.leader_id, Some(2));
        assert!(!leader.is_leader);
    }

    #[tokio::test]
    async fn test_submit_on_follower_returns_hint() {
        let (server, shared, kv) = follower_node();
        let handle = server.start();
        let base = serve(create_client_router_with_reads(handle, shared, kv)).await;

        let response = reqwest::Client::new()
            .post(format!("{}/client/submit", base))
            .json(&SubmitRequest {
                command: serde_json::json!({"type": "set", "key": "k", "value": "v"}),
            })
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.leader_hint, Some(2));
    }

    #[tokio::test]
    async fn test_direct_read_endpoint() {
        use crate::state_machine::kv::KvCommand;
        use crate::state_machine::StateMachine;

        let (server, shared, kv) = follower_node();
        kv.lock()
            .unwrap()
            .apply(
                &KvCommand::Set {
                    key: "k".to_string(),
                    value: "v".to_string(),
                }
                .encode(),
            )
            .unwrap();
        let handle = server.start();
        let base = serve(create_client_router_with_reads(handle, shared, kv)).await;

        let response: ReadResponse = reqwest::get(format!("{}/client/get/k", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response.value, "v");

        let missing = reqwest::get(format!("{}/client/get/absent", base))
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
