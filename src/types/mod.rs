mod log;
mod message;
mod primitives;

pub use log::LogEntry;
pub use message::{AppendEntries, AppendEntriesReply, RequestVote, RequestVoteReply, Submission};
pub use primitives::{Generation, LogIndex, PeerId, Term};
