use serde::{Deserialize, Serialize};

use super::primitives::Term;

/// A single entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub term: Term,
    pub command: C,
}
