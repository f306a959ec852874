use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{LogIndex, PeerId};

/// The three roles a node moves between. Exactly one is held at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Follower => "Follower",
            RoleKind::Candidate => "Candidate",
            RoleKind::Leader => "Leader",
        };
        f.write_str(name)
    }
}

/// Followers only answer RPCs. Without word from a leader they start an election.
pub struct Follower {
    pub leader_id: Option<PeerId>,
}

impl Follower {
    pub fn new() -> Self {
        Self { leader_id: None }
    }

    pub fn set_leader(&mut self, leader_id: PeerId) {
        self.leader_id = Some(leader_id);
    }
}

impl Default for Follower {
    fn default() -> Self {
        Self::new()
    }
}

/// A candidate tallies votes for itself in its own term.
pub struct Candidate {
    votes_received: Vec<PeerId>,
}

impl Candidate {
    /// Starts with the self-vote.
    pub fn new(self_id: PeerId) -> Self {
        Self {
            votes_received: vec![self_id],
        }
    }

    pub fn record_vote(&mut self, from: PeerId) {
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
    }

    pub fn votes(&self) -> usize {
        self.votes_received.len()
    }

    /// Strictly more than half of all peers, self included.
    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.votes_received.len() * 2 > cluster_size
    }
}

/// Acknowledgements gathered for one submitted index.
pub struct Agreement {
    acked: Vec<PeerId>,
}

impl Agreement {
    /// The leader's own copy counts as the first acknowledgement.
    pub fn new(leader: PeerId) -> Self {
        Self {
            acked: vec![leader],
        }
    }

    /// Returns false for a repeated acknowledgement from the same peer.
    pub fn acknowledge(&mut self, from: PeerId) -> bool {
        if self.acked.contains(&from) {
            return false;
        }
        self.acked.push(from);
        true
    }

    pub fn acks(&self) -> usize {
        self.acked.len()
    }

    pub fn is_reached(&self, cluster_size: usize) -> bool {
        self.acked.len() * 2 > cluster_size
    }
}

/// Volatile leader state, rebuilt on every election win.
///
/// Cursors are kept for every position in the peer list, the leader's own
/// included; the leader never updates its own slot.
pub struct Leader {
    next_index: Vec<LogIndex>,
    match_index: Vec<LogIndex>,
    /// Agreement rounds in flight, keyed by the index being agreed on.
    agreements: BTreeMap<LogIndex, Agreement>,
    /// Submitted indices waiting for their predecessor to commit.
    waiting: BTreeSet<LogIndex>,
}

impl Leader {
    /// nextIndex starts just past the leader's log, matchIndex at NONE.
    pub fn new(cluster_size: usize, log_len: usize) -> Self {
        Self {
            next_index: vec![LogIndex::from(log_len); cluster_size],
            match_index: vec![LogIndex::NONE; cluster_size],
            agreements: BTreeMap::new(),
            waiting: BTreeSet::new(),
        }
    }

    pub fn next_index_for(&self, peer: PeerId) -> Option<LogIndex> {
        self.next_index.get(peer.index()).copied()
    }

    pub fn match_index_for(&self, peer: PeerId) -> Option<LogIndex> {
        self.match_index.get(peer.index()).copied()
    }

    pub fn match_indices(&self) -> impl Iterator<Item = LogIndex> + '_ {
        self.match_index.iter().copied()
    }

    /// Record a successful append that carried entries up to `last_sent`.
    pub fn record_success(&mut self, from: PeerId, last_sent: LogIndex) {
        let idx = from.index();
        if idx >= self.next_index.len() {
            return;
        }
        self.next_index[idx] = last_sent.next();
        self.match_index[idx] = self.match_index[idx].max(last_sent);
    }

    /// Step nextIndex back by one after a rejected append.
    pub fn record_failure(&mut self, from: PeerId) {
        if let Some(next) = self.next_index.get_mut(from.index()) {
            if *next > LogIndex::FIRST {
                *next = next.prev();
            }
        }
    }

    pub fn queue_agreement(&mut self, index: LogIndex) {
        self.waiting.insert(index);
    }

    /// Oldest submitted index still waiting to start.
    pub fn first_waiting(&self) -> Option<LogIndex> {
        self.waiting.first().copied()
    }

    pub fn take_waiting(&mut self, index: LogIndex) -> bool {
        self.waiting.remove(&index)
    }

    pub fn open_agreement(&mut self, index: LogIndex, leader: PeerId) -> &mut Agreement {
        self.agreements
            .entry(index)
            .or_insert_with(|| Agreement::new(leader))
    }

    /// Open agreement rounds at or below what `peer` is known to hold.
    pub fn agreements_matched_by(&self, peer: PeerId) -> Vec<LogIndex> {
        let Some(matched) = self.match_index_for(peer) else {
            return Vec::new();
        };
        self.agreements.range(..=matched).map(|(&index, _)| index).collect()
    }

    pub fn agreement_mut(&mut self, index: LogIndex) -> Option<&mut Agreement> {
        self.agreements.get_mut(&index)
    }

    /// Forget agreement rounds at or below the commit index.
    pub fn close_agreements_through(&mut self, commit_index: LogIndex) {
        self.agreements.retain(|&index, _| index > commit_index);
    }

    pub fn open_agreements(&self) -> usize {
        self.agreements.len()
    }
}
