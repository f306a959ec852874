use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::apply::SyncCommand;
use crate::config::ServerConfig;
use crate::error::{RaftError, Result};
use crate::peer::{LoggingRegistry, Peer, ServiceRegistry};
use crate::runtime::Raft;
use crate::state::RoleKind;
use crate::store::MemoryStore;
use crate::transport::{self, TcpTransport};

/// A running cluster member: the consensus node, its RPC listener and the
/// store committed commands are applied to.
pub struct Server {
    raft: Raft<SyncCommand>,
    store: MemoryStore,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the RPC listener and start the consensus node with the default
    /// service registry.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        Self::start_with_registry(config, Arc::new(LoggingRegistry)).await
    }

    pub async fn start_with_registry(
        config: ServerConfig,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;

        let rpc_timeout = config.raft.rpc_timeout();
        let peers = config
            .peers
            .iter()
            .map(|info| {
                if info.secure {
                    warn!(
                        instance = %info.instance_id,
                        "peer is marked secure but will be reached over plain TCP"
                    );
                }
                Peer::new(
                    info.clone(),
                    Arc::new(TcpTransport::new(info.address(), rpc_timeout)),
                    Arc::clone(&registry),
                )
            })
            .collect();

        let store = MemoryStore::new();
        let raft = Raft::start(peers, config.me, store.clone(), &config.raft)?;
        info!(peer = %config.me, addr = %local_addr, "server started");

        Ok(Self {
            raft,
            store,
            listener,
            local_addr,
        })
    }

    pub fn raft(&self) -> &Raft<SyncCommand> {
        &self.raft
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve peer calls until `shutdown` completes or accepting fails, then
    /// stop the consensus node.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self { raft, listener, .. } = self;
        let watcher = tokio::spawn(announce_leadership(raft.clone()));

        let result = tokio::select! {
            served = transport::serve(listener, raft.clone()) => served.map_err(RaftError::from),
            _ = shutdown => {
                info!(peer = %raft.me(), "shutting down");
                Ok(())
            }
        };

        raft.shutdown();
        watcher.abort();
        result
    }
}

/// Take this instance into service each time it becomes leader.
async fn announce_leadership(raft: Raft<SyncCommand>) {
    let mut roles = raft.subscribe_role();
    loop {
        let role = *roles.borrow_and_update();
        if role == RoleKind::Leader {
            if let Err(error) = raft.take_into_service().await {
                warn!(%error, "failed to take instance into service");
            }
        }
        if roles.changed().await.is_err() {
            break;
        }
    }
}
