//! Cluster integration tests
//!
//! Spin up real 3-node clusters over HTTP/TCP and exercise the end-to-end
//! flows: election, replication and apply, leader redirects, and loss of
//! majority during a submission.

use std::time::Duration;

use tokio::time::Instant;

use quorum::api::client_http::{ErrorResponse, StatusResponse, SubmitRequest, SubmitResponse};
use quorum::core::raft_core::{AppendEntriesArgs, RaftState};
use quorum::core::raft_server::RaftError;
use quorum::state_machine::kv::KvCommand;
use quorum::testing::TestCluster;

const LEADER_DEADLINE: Duration = Duration::from_secs(5);
const SETTLE_DEADLINE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn set(key: &str, value: &str) -> Vec<u8> {
    KvCommand::Set {
        key: key.to_string(),
        value: value.to_string(),
    }
    .encode()
}

/// Poll until every follower reports the given node as leader
async fn wait_for_leader_hints(cluster: &TestCluster, leader_id: u64) {
    let end = Instant::now() + SETTLE_DEADLINE;
    loop {
        let mut all_hinted = true;
        for node in &cluster.nodes {
            let core = node.shared_core.lock().await;
            if core.id != leader_id && core.current_leader != Some(leader_id) {
                all_hinted = false;
            }
        }
        if all_hinted {
            return;
        }
        assert!(Instant::now() < end, "followers never learned the leader");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[tokio::test]
async fn test_single_leader_elected_and_hinted_by_followers() {
    let mut cluster = TestCluster::new().await;

    let leader_id = cluster.wait_for_leader(LEADER_DEADLINE).await;
    wait_for_leader_hints(&cluster, leader_id).await;

    // Exactly one node considers itself leader
    let mut leader_count = 0;
    for node in &cluster.nodes {
        let core = node.shared_core.lock().await;
        if core.state == RaftState::Leader {
            leader_count += 1;
        }
    }
    assert_eq!(leader_count, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_command_replicates_and_applies_on_all_nodes() {
    let mut cluster = TestCluster::new().await;
    let leader_id = cluster.wait_for_leader(LEADER_DEADLINE).await;

    // The leader applies as soon as a majority acknowledges
    let result = cluster
        .node(leader_id)
        .raft_handle
        .submit(set("color", "green"))
        .await
        .expect("submit should commit");
    assert_eq!(result, b"green".to_vec());
    assert_eq!(
        cluster.node(leader_id).kv_store.lock().unwrap().get("color"),
        Some("green".to_string())
    );

    // Followers apply once a later round carries the updated leader commit
    let end = Instant::now() + SETTLE_DEADLINE;
    loop {
        let converged = cluster
            .nodes
            .iter()
            .all(|node| node.kv_store.lock().unwrap().get("color") == Some("green".to_string()));
        if converged {
            break;
        }
        assert!(Instant::now() < end, "followers never applied the command");
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    // Commit indexes converge too
    let leader_commit = cluster.node(leader_id).shared_core.lock().await.commit_index;
    let end = Instant::now() + SETTLE_DEADLINE;
    loop {
        let mut converged = true;
        for node in &cluster.nodes {
            if node.shared_core.lock().await.commit_index < leader_commit {
                converged = false;
            }
        }
        if converged {
            break;
        }
        assert!(Instant::now() < end, "commit indexes never converged");
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submit_to_follower_redirects_to_leader() {
    let mut cluster = TestCluster::new().await;
    let leader_id = cluster.wait_for_leader(LEADER_DEADLINE).await;
    wait_for_leader_hints(&cluster, leader_id).await;

    let follower_addr = cluster
        .nodes
        .iter()
        .find(|n| n.id != leader_id)
        .unwrap()
        .addr();

    let client = reqwest::Client::new();
    let request = SubmitRequest {
        command: serde_json::json!({"type": "set", "key": "k", "value": "v"}),
    };

    // Follower refuses and names the leader
    let response = client
        .post(format!("http://{}/client/submit", follower_addr))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.leader_hint, Some(leader_id));

    // Redirected submission succeeds
    let leader_addr = cluster.node(leader_id).addr();
    let response = client
        .post(format!("http://{}/client/submit", leader_addr))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: SubmitResponse = response.json().await.unwrap();
    assert_eq!(body.result, "v");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_status_endpoint_reports_cluster_view() {
    let mut cluster = TestCluster::new().await;
    let leader_id = cluster.wait_for_leader(LEADER_DEADLINE).await;

    cluster
        .node(leader_id)
        .raft_handle
        .submit(set("k", "v"))
        .await
        .unwrap();

    let status: StatusResponse = reqwest::get(format!(
        "http://{}/client/status",
        cluster.node(leader_id).addr()
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(status.node_id, leader_id);
    assert_eq!(status.state, "leader");
    assert_eq!(status.leader_id, Some(leader_id));
    // No-op plus the command
    assert!(status.commit_index >= 2);
    assert_eq!(status.last_applied, status.commit_index);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submit_without_majority_is_indeterminate() {
    let mut cluster = TestCluster::new().await;
    let leader_id = cluster.wait_for_leader(LEADER_DEADLINE).await;

    // Both followers stop responding
    let follower_ids: Vec<u64> = cluster
        .nodes
        .iter()
        .map(|n| n.id)
        .filter(|&id| id != leader_id)
        .collect();
    for id in follower_ids {
        cluster.node_mut(id).sever();
    }

    let result = cluster
        .node(leader_id)
        .raft_handle
        .submit(set("k", "v"))
        .await;

    // Never a false success: the outcome is reported as unknown
    match result {
        Err(RaftError::CommitTimeout) | Err(RaftError::Indeterminate) => {}
        other => panic!("expected indeterminate/timeout, got {:?}", other),
    }

    // The entry must not have been applied locally
    assert_eq!(
        cluster.node(leader_id).kv_store.lock().unwrap().get("k"),
        None
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_deposed_leader_steps_down_when_partition_heals() {
    let mut cluster = TestCluster::new().await;
    let old_leader_id = cluster.wait_for_leader(LEADER_DEADLINE).await;
    let old_term = cluster
        .node(old_leader_id)
        .shared_core
        .lock()
        .await
        .current_term;

    // Freeze the old leader: from the followers' point of view it has
    // dropped off the network, but it still believes in its own term
    cluster.node(old_leader_id).raft_handle.shutdown().await;
    cluster.node_mut(old_leader_id).sever();

    // The remaining majority elects a new leader at a higher term
    let new_leader_id = {
        let end = Instant::now() + LEADER_DEADLINE;
        loop {
            let mut found = None;
            for node in &cluster.nodes {
                if node.id == old_leader_id {
                    continue;
                }
                let core = node.shared_core.lock().await;
                if core.state == RaftState::Leader {
                    found = Some((core.id, core.current_term));
                }
            }
            if let Some((id, term)) = found {
                assert!(term > old_term, "new leader must hold a higher term");
                break id;
            }
            assert!(Instant::now() < end, "no new leader elected");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    // Heal the partition: the old leader hears one AppendEntries from the
    // new leader's term and yields
    let heal_args = {
        let core = cluster.node(new_leader_id).shared_core.lock().await;
        AppendEntriesArgs {
            term: core.current_term,
            leader_id: core.id,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        }
    };
    {
        let mut old_core = cluster.node(old_leader_id).shared_core.lock().await;
        assert_eq!(old_core.state, RaftState::Leader);
        let output = old_core.handle_append_entries(&heal_args);
        assert!(output.result.term > old_term);
        assert_eq!(old_core.state, RaftState::Follower);
        assert_eq!(old_core.current_leader, Some(new_leader_id));
    }

    cluster.shutdown().await;
}
