use crate::state::RoleKind;
use crate::types::{AppendEntries, Generation, LogIndex, PeerId, RequestVote};

/// Which kind of append-entries round a call belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Round {
    /// Periodic leadership assertion. Carries whatever the peer is missing.
    Heartbeat,
    /// Agreement on `agreement`, currently probing the peer at `cursor`.
    /// Each rejection retries one index earlier until `cursor` reaches zero.
    Replicate {
        agreement: LogIndex,
        cursor: LogIndex,
    },
}

/// Everything the leader needs to interpret an append-entries reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendContext {
    pub generation: Generation,
    pub round: Round,
    /// Index of the last entry carried by the call, if it carried any.
    pub last_sent: Option<LogIndex>,
}

/// Effects the consensus core asks its driver to carry out.
#[derive(Debug)]
pub enum Action<C> {
    /// Issue a request-vote call and report the reply back.
    RequestVote {
        to: PeerId,
        generation: Generation,
        args: RequestVote,
    },
    /// Issue an append-entries call and report the reply back.
    AppendEntries {
        to: PeerId,
        context: AppendContext,
        args: AppendEntries<C>,
    },
    /// Cancel any pending election timer and start a fresh one.
    ResetElectionTimer,
    CancelElectionTimer,
    /// Arm the next heartbeat tick.
    ScheduleHeartbeat,
    CancelHeartbeat,
    /// Hand a committed command to the state machine.
    Apply { index: LogIndex, command: C },
    RoleChanged(RoleKind),
}
