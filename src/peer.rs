use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RaftError;
use crate::transport::{RaftTransport, TransportError};
use crate::types::{AppendEntries, AppendEntriesReply, RequestVote, RequestVoteReply};

/// Identity of a cluster member as supplied by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub instance_id: String,
}

impl PeerInfo {
    /// `host:port` of the member's RPC listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "tls://" } else { "" };
        write!(f, "{}={}{}", self.instance_id, scheme, self.address())
    }
}

/// Parses `INSTANCE=HOST:PORT`, with an optional `tls://` before the host.
impl FromStr for PeerInfo {
    type Err = RaftError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RaftError::Config(format!("invalid peer '{input}': {reason}"));

        let (instance_id, address) = input
            .split_once('=')
            .ok_or_else(|| invalid("expected INSTANCE=HOST:PORT"))?;
        if instance_id.is_empty() {
            return Err(invalid("empty instance id"));
        }
        let (secure, address) = match address.strip_prefix("tls://") {
            Some(rest) => (true, rest),
            None => (false, address),
        };
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port.parse().map_err(|_| invalid("port is not a number"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            secure,
            instance_id: instance_id.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Out-of-service / into-service signaling toward service discovery.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn take_into_service(&self, instance: &PeerInfo) -> Result<(), RegistryError>;
    async fn take_out_of_service(&self, instance: &PeerInfo) -> Result<(), RegistryError>;
}

/// Registry used when no discovery service is wired in. Only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingRegistry;

#[async_trait]
impl ServiceRegistry for LoggingRegistry {
    async fn take_into_service(&self, instance: &PeerInfo) -> Result<(), RegistryError> {
        info!(instance = %instance.instance_id, address = %instance.address(), "instance taken into service");
        Ok(())
    }

    async fn take_out_of_service(&self, instance: &PeerInfo) -> Result<(), RegistryError> {
        info!(instance = %instance.instance_id, address = %instance.address(), "instance taken out of service");
        Ok(())
    }
}

/// A cluster member: its identity, how to reach it, and where to report
/// its service state.
pub struct Peer<C> {
    info: PeerInfo,
    transport: Arc<dyn RaftTransport<C>>,
    registry: Arc<dyn ServiceRegistry>,
}

impl<C> Clone for Peer<C> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<C> Peer<C> {
    pub fn new(
        info: PeerInfo,
        transport: Arc<dyn RaftTransport<C>>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Self {
        Self {
            info,
            transport,
            registry,
        }
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub async fn request_vote(&self, args: RequestVote) -> Result<RequestVoteReply, TransportError> {
        self.transport.request_vote(args).await
    }

    pub async fn append_entries(
        &self,
        args: AppendEntries<C>,
    ) -> Result<AppendEntriesReply, TransportError> {
        self.transport.append_entries(args).await
    }

    pub async fn take_into_service(&self) -> Result<(), RegistryError> {
        self.registry.take_into_service(&self.info).await
    }

    pub async fn take_out_of_service(&self) -> Result<(), RegistryError> {
        self.registry.take_out_of_service(&self.info).await
    }
}

impl<C> fmt::Debug for Peer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").field("info", &self.info).finish_non_exhaustive()
    }
}
