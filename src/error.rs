use std::io;

use crate::peer::RegistryError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("config: {0}")]
    Config(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("service registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The driver loop has exited; the handle can no longer reach the node.
    #[error("consensus node stopped")]
    Stopped,
}

pub type Result<T, E = RaftError> = std::result::Result<T, E>;
