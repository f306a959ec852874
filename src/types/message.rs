use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::primitives::{LogIndex, PeerId, Term};

/// RequestVote RPC arguments.
///
/// `last_log_index`/`last_log_term` advertise the candidate's commit index and
/// the term of the entry there, not its true last log position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: PeerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. Empty `entries` makes it a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntries<C> {
    pub term: Term,
    pub leader_id: PeerId,
    pub prev_log_index: LogIndex,
    /// None when `prev_log_index` is `LogIndex::NONE`.
    pub prev_log_term: Option<Term>,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

/// Outcome of submitting a client command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Log index assigned to the command, `LogIndex::NONE` when not leader.
    pub index: LogIndex,
    pub term: Term,
    pub is_leader: bool,
}
