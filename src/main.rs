use std::net::SocketAddr;

use clap::Parser;
use raft_sync::config::{RaftConfig, ServerConfig};
use raft_sync::peer::PeerInfo;
use raft_sync::server::Server;
use raft_sync::types::PeerId;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Replicate session and plugin storage across server instances")]
struct Args {
    /// This node's position in the peer list (0-based).
    #[arg(long)]
    me: usize,

    /// TCP address to listen on for peer RPCs.
    #[arg(long)]
    listen: SocketAddr,

    /// A cluster member in the form INSTANCE=HOST:PORT (prefix the host with
    /// tls:// for secure members). Repeat for every member, this one included,
    /// in the same order on all nodes.
    #[arg(long = "peer", required = true)]
    peers: Vec<PeerInfo>,

    /// Lower bound of the election timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    election_timeout_min_ms: u64,

    /// Upper bound of the election timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    election_timeout_max_ms: u64,

    /// Heartbeat period as a fraction of the lower election bound.
    #[arg(long, default_value_t = 0.75)]
    heartbeat_fraction: f64,

    /// Per-call timeout for peer RPCs in milliseconds.
    #[arg(long, default_value_t = 500)]
    rpc_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        me: PeerId::from(args.me),
        listen: args.listen,
        peers: args.peers,
        raft: RaftConfig {
            election_timeout_ms: (args.election_timeout_min_ms, args.election_timeout_max_ms),
            heartbeat_fraction: args.heartbeat_fraction,
            rpc_timeout_ms: args.rpc_timeout_ms,
        },
    };

    Server::start(config)
        .await?
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
