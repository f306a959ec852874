use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::peer::PeerInfo;
use crate::types::PeerId;

/// Timing of the consensus protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RaftConfig {
    /// Bounds, in milliseconds, of the election timeout. A value is drawn
    /// from `[min, max)` once per node.
    pub election_timeout_ms: (u64, u64),
    /// Heartbeat period as a fraction of the lower election bound.
    pub heartbeat_fraction: f64,
    /// How long a single peer call may take before it counts as unanswered.
    pub rpc_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: (1000, 2000),
            heartbeat_fraction: 0.75,
            rpc_timeout_ms: 500,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        let (min, max) = self.election_timeout_ms;
        if min == 0 {
            return Err(RaftError::Config("election timeout lower bound must be positive".into()));
        }
        if max <= min {
            return Err(RaftError::Config(format!(
                "election timeout upper bound {max}ms must exceed lower bound {min}ms"
            )));
        }
        if !(self.heartbeat_fraction > 0.0 && self.heartbeat_fraction < 1.0) {
            return Err(RaftError::Config(format!(
                "heartbeat fraction {} must lie strictly between 0 and 1",
                self.heartbeat_fraction
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(RaftError::Config("rpc timeout must be positive".into()));
        }
        Ok(())
    }

    /// Draw this node's election timeout. Called once at startup; the value
    /// is kept for the lifetime of the node.
    pub fn draw_election_timeout(&self) -> Duration {
        let (min, max) = self.election_timeout_ms;
        Duration::from_millis(rand::rng().random_range(min..max))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        let lower = self.election_timeout_ms.0 as f64;
        let millis = (lower * self.heartbeat_fraction).round() as u64;
        Duration::from_millis(millis.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Everything a server process needs to join the cluster.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Own position in `peers`.
    pub me: PeerId,
    /// Address the RPC listener binds to.
    pub listen: SocketAddr,
    /// Every cluster member, this one included, in the same order on all nodes.
    pub peers: Vec<PeerInfo>,
    pub raft: RaftConfig,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(RaftError::Config("peer list is empty".into()));
        }
        if self.me.index() >= self.peers.len() {
            return Err(RaftError::Config(format!(
                "own index {} is outside the peer list of {}",
                self.me.index(),
                self.peers.len()
            )));
        }
        self.raft.validate()
    }
}
