//! Single-leader replicated command log.
//!
//! Keeps user sessions and per-plugin key/value storage identical across a
//! fixed set of server instances. One instance is elected leader, accepts
//! commands, replicates them to the others and hands every committed command
//! to a [`StateMachine`] on each instance, in log order.
//!
//! [`node::Node`] holds the protocol itself and performs no I/O; [`Raft`]
//! runs it on Tokio against a [`transport::RaftTransport`].

pub mod action;
pub mod apply;
#[cfg(test)]
mod cluster;
pub mod config;
pub mod error;
pub mod log;
pub mod node;
pub mod peer;
pub mod runtime;
pub mod server;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;

pub use apply::{SyncCommand, SyncTarget};
pub use config::{RaftConfig, ServerConfig};
pub use error::{RaftError, Result};
pub use node::{Node, Status};
pub use runtime::{Raft, StateMachine};
pub use state::RoleKind;
pub use store::MemoryStore;
pub use types::{LogIndex, PeerId, Submission, Term};
