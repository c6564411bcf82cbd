//! Quorum server binary
//!
//! Runs a single consensus node with separate ports for cluster RPC and the
//! client API.
//!
//! Example for a 3-node cluster:
//!   quorum-server --id 1 --transport-port 8001 --api-port 9001 --data-dir /tmp/quorum1 \
//!       --peers 2=127.0.0.1:8002,3=127.0.0.1:8003
//!   quorum-server --id 2 --transport-port 8002 --api-port 9002 --data-dir /tmp/quorum2 \
//!       --peers 1=127.0.0.1:8001,3=127.0.0.1:8003
//!   quorum-server --id 3 --transport-port 8003 --api-port 9003 --data-dir /tmp/quorum3 \
//!       --peers 1=127.0.0.1:8001,2=127.0.0.1:8002

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quorum::api::client_http::create_client_router_with_reads;
use quorum::core::config::RaftConfig;
use quorum::core::raft_core::RaftCore;
use quorum::core::raft_server::RaftServer;
use quorum::state_machine::kv::{KeyValueStore, SharedKvStore};
use quorum::storage::file::FileStorage;
use quorum::transport::http::{create_router, HttpTransport};

#[derive(Debug, Parser)]
#[command(name = "quorum-server", about = "Run a single consensus node")]
struct Args {
    /// Unique node ID within the cluster
    #[arg(long)]
    id: u64,

    /// Port for Raft RPC between nodes (/raft/* endpoints)
    #[arg(long)]
    transport_port: u16,

    /// Port for client requests (/client/* endpoints)
    #[arg(long)]
    api_port: u16,

    /// Directory for persistent state (term, vote, log)
    #[arg(long)]
    data_dir: PathBuf,

    /// Peer list as id=addr pairs, e.g. 2=127.0.0.1:8002,3=127.0.0.1:8003
    #[arg(long, value_delimiter = ',', value_parser = parse_peer)]
    peers: Vec<(u64, String)>,

    /// Leader replication interval in milliseconds
    #[arg(long, default_value_t = 150)]
    heartbeat_ms: u64,

    /// Election timeout range in milliseconds, lower bound
    #[arg(long, default_value_t = 300)]
    election_timeout_min_ms: u64,

    /// Election timeout range in milliseconds, upper bound
    #[arg(long, default_value_t = 500)]
    election_timeout_max_ms: u64,
}

fn parse_peer(s: &str) -> Result<(u64, String), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=addr, got {:?}", s))?;
    let id = id.parse().map_err(|e| format!("invalid peer ID: {}", e))?;
    Ok((id, addr.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let peers: HashMap<u64, String> = args.peers.iter().cloned().collect();
    let peer_ids: Vec<u64> = peers.keys().copied().collect();

    info!(
        node = args.id,
        transport_port = args.transport_port,
        api_port = args.api_port,
        data_dir = %args.data_dir.display(),
        ?peers,
        "starting node"
    );

    let config = RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_election_timeout(
            Duration::from_millis(args.election_timeout_min_ms),
            Duration::from_millis(args.election_timeout_max_ms),
        );

    let storage = FileStorage::new(&args.data_dir)?;
    let kv_store: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
    let transport = HttpTransport::new(peers, config.rpc_timeout)?;

    let core = RaftCore::new(
        args.id,
        peer_ids,
        Box::new(storage),
        Box::new(kv_store.clone()),
    )?;

    let (server, shared_core) = RaftServer::with_config(core, transport, config);
    let raft_handle = server.start();

    // Cluster RPC surface
    let transport_addr = SocketAddr::from(([0, 0, 0, 0], args.transport_port));
    let transport_listener = TcpListener::bind(transport_addr).await?;
    let transport_router = create_router(shared_core.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(transport_listener, transport_router).await {
            tracing::error!(error = %err, "transport server failed");
        }
    });

    // Client API surface
    let api_addr = SocketAddr::from(([0, 0, 0, 0], args.api_port));
    let api_listener = TcpListener::bind(api_addr).await?;
    let api_router =
        create_client_router_with_reads(raft_handle.clone(), shared_core, kv_store);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(api_listener, api_router).await {
            tracing::error!(error = %err, "api server failed");
        }
    });

    info!(node = args.id, "node running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!(node = args.id, "shutting down");
    raft_handle.shutdown().await;

    Ok(())
}
