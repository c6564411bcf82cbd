//! Testing utilities for Raft cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process clusters over real
//! HTTP/TCP on ephemeral ports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::api::client_http::create_client_router_with_reads;
use crate::core::config::RaftConfig;
use crate::core::raft_core::{RaftCore, RaftState};
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::state_machine::kv::{KeyValueStore, SharedKvStore};
use crate::storage::memory::MemoryStorage;
use crate::transport::http::{create_router, HttpTransport};

/// A single test node in the cluster
pub struct TestNode {
    /// Node ID
    pub id: u64,
    /// HTTP address serving both the RPC and client surfaces
    pub addr: SocketAddr,
    /// Shutdown for the HTTP server (dropping severs the node from the net)
    http_shutdown_tx: Option<oneshot::Sender<()>>,
    /// Raft server handle
    pub raft_handle: RaftHandle,
    /// Shared KV store
    pub kv_store: SharedKvStore,
    /// Shared Raft core
    pub shared_core: SharedCore,
}

impl TestNode {
    /// The node's address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop this node's HTTP server, making it unreachable to peers and
    /// clients. The Raft event loop keeps running, as a partitioned node's
    /// would.
    pub fn sever(&mut self) {
        if let Some(tx) = self.http_shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A test cluster of Raft nodes
pub struct TestCluster {
    /// All nodes in the cluster
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create and start a new 3-node cluster
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// Create and start a cluster with the specified number of nodes
    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_config(count, None).await
    }

    /// Create and start a cluster with the specified node count and config
    pub async fn with_nodes_and_config(count: usize, config: Option<RaftConfig>) -> Self {
        let node_ids: Vec<u64> = (1..=count as u64).collect();

        // Bind all listeners first so every node knows every address
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();

        for &id in &node_ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            addrs.insert(id, addr.to_string());
            listeners.push((id, listener, addr));
        }

        // Fast timeouts keep tests snappy
        let config = config.unwrap_or_else(|| {
            RaftConfig::default()
                .with_heartbeat_interval(Duration::from_millis(50))
                .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
                .with_rpc_timeout(Duration::from_millis(40))
                .with_submit_timeout(Duration::from_millis(1500))
        });

        let mut nodes = Vec::new();

        for (id, listener, addr) in listeners {
            let peers: HashMap<u64, String> = addrs
                .iter()
                .filter(|(&peer_id, _)| peer_id != id)
                .map(|(&peer_id, addr)| (peer_id, addr.clone()))
                .collect();
            let peer_ids: Vec<u64> = peers.keys().copied().collect();

            let kv_store: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));

            let transport = HttpTransport::new(peers, config.rpc_timeout).unwrap();

            let core = RaftCore::new(
                id,
                peer_ids,
                Box::new(MemoryStorage::new()),
                Box::new(kv_store.clone()),
            )
            .unwrap();

            let (server, shared_core) = RaftServer::with_config(core, transport, config.clone());
            let raft_handle = server.start();

            let app = combined_router(shared_core.clone(), raft_handle.clone(), kv_store.clone());

            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });

            nodes.push(TestNode {
                id,
                addr,
                http_shutdown_tx: Some(http_shutdown_tx),
                raft_handle,
                kv_store,
                shared_core,
            });
        }

        TestCluster { nodes }
    }

    /// Wait until exactly one node reports itself leader and return its ID.
    /// Panics if no leader emerges within the deadline.
    pub async fn wait_for_leader(&self, deadline: Duration) -> u64 {
        let end = Instant::now() + deadline;
        loop {
            let mut leaders = Vec::new();
            for node in &self.nodes {
                let core = node.shared_core.lock().await;
                if core.state == RaftState::Leader {
                    leaders.push(core.id);
                }
            }
            if leaders.len() == 1 {
                return leaders[0];
            }
            if Instant::now() >= end {
                panic!("no single leader within {:?}, saw {:?}", deadline, leaders);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Node by ID
    pub fn node(&self, id: u64) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    /// Mutable node by ID
    pub fn node_mut(&mut self, id: u64) -> &mut TestNode {
        self.nodes.iter_mut().find(|n| n.id == id).unwrap()
    }

    /// Shut down every node
    pub async fn shutdown(&mut self) {
        for node in &mut self.nodes {
            node.sever();
            node.raft_handle.shutdown().await;
        }
    }
}

/// One router serving both the peer RPC surface and the client API, as the
/// production binary does on two listeners
fn combined_router(core: SharedCore, handle: RaftHandle, kv: SharedKvStore) -> Router {
    create_router(core.clone()).merge(create_client_router_with_reads(handle, core, kv))
}
