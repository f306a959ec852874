use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::{Action, AppendContext, Round};
use crate::log::Log;
use crate::state::{Candidate, Follower, Leader, RoleKind};
use crate::types::{
    AppendEntries, AppendEntriesReply, Generation, LogEntry, LogIndex, PeerId, RequestVote,
    RequestVoteReply, Submission, Term,
};

/// State that the protocol treats as durable. Held in memory only.
pub struct PersistentState<C> {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
    pub log: Log<C>,
}

/// Volatile state on all servers.
pub struct VolatileState {
    /// Highest index known to be committed.
    pub commit_index: LogIndex,
    /// Highest index handed to the state machine.
    pub last_applied: LogIndex,
}

/// Server role with associated state.
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }
}

/// Point-in-time view of a node, for polling commit progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Status {
    pub id: PeerId,
    pub role: RoleKind,
    pub term: Term,
    pub leader_id: Option<PeerId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_len: usize,
}

/// The consensus state machine of one cluster member.
///
/// Pure protocol logic: every handler mutates the node and returns the
/// actions (RPCs to issue, timers to arm, commands to apply) that a driver
/// must carry out. Handlers never block and never fail.
pub struct Node<C> {
    pub id: PeerId,
    pub cluster_size: usize,
    pub persistent: PersistentState<C>,
    pub volatile: VolatileState,
    pub role: Role,
    started: bool,
    generation: Generation,
}

impl<C: Clone> Node<C> {
    /// Create a node at position `id` of a `cluster_size`-member peer list.
    /// Starts as follower in term 0 with an empty log.
    pub fn new(id: PeerId, cluster_size: usize) -> Self {
        Self {
            id,
            cluster_size,
            persistent: PersistentState {
                current_term: Term::ZERO,
                voted_for: None,
                log: Log::new(),
            },
            volatile: VolatileState {
                commit_index: LogIndex::NONE,
                last_applied: LogIndex::NONE,
            },
            role: Role::Follower(Follower::new()),
            started: false,
            generation: Generation::default(),
        }
    }

    /// Begin participating: arm the election timer and accept vote requests.
    pub fn start(&mut self) -> Vec<Action<C>> {
        info!(peer = %self.id, cluster_size = self.cluster_size, "starting consensus node");
        self.started = true;
        vec![Action::ResetElectionTimer]
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn role_kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.volatile.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.volatile.last_applied
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn leader(&self) -> Option<&Leader> {
        match &self.role {
            Role::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub fn status(&self) -> Status {
        let leader_id = match &self.role {
            Role::Follower(follower) => follower.leader_id,
            Role::Candidate(_) => None,
            Role::Leader(_) => Some(self.id),
        };
        Status {
            id: self.id,
            role: self.role.kind(),
            term: self.persistent.current_term,
            leader_id,
            commit_index: self.volatile.commit_index,
            last_applied: self.volatile.last_applied,
            log_len: self.persistent.log.len(),
        }
    }

    fn others(&self) -> Vec<PeerId> {
        (0..self.cluster_size)
            .map(PeerId::from)
            .filter(|&peer| peer != self.id)
            .collect()
    }

    fn set_role(&mut self, role: Role, actions: &mut Vec<Action<C>>) {
        let previous = self.role.kind();
        self.role = role;
        self.generation = self.generation.next();

        let kind = self.role.kind();
        if kind != previous {
            info!(
                peer = %self.id,
                term = %self.persistent.current_term,
                from = %previous,
                to = %kind,
                "role changed"
            );
            actions.push(Action::RoleChanged(kind));
        }
    }

    /// Adopt a higher observed term: clear the vote and revert to follower.
    /// Returns true if the term was adopted.
    fn ensure_term(&mut self, observed: Term, actions: &mut Vec<Action<C>>) -> bool {
        if observed <= self.persistent.current_term {
            return false;
        }
        info!(
            peer = %self.id,
            observed = %observed,
            current = %self.persistent.current_term,
            "observed higher term, converting to follower"
        );
        self.persistent.current_term = observed;
        self.persistent.voted_for = None;
        self.generation = self.generation.next();
        self.step_down(actions);
        true
    }

    fn step_down(&mut self, actions: &mut Vec<Action<C>>) {
        if matches!(self.role, Role::Follower(_)) {
            return;
        }
        self.set_role(Role::Follower(Follower::new()), actions);
        actions.push(Action::CancelHeartbeat);
        actions.push(Action::ResetElectionTimer);
    }

    // ---------------------------------------------------------------------
    // Elections
    // ---------------------------------------------------------------------

    /// Election timer fired. Followers and candidates start a new election.
    pub fn election_timeout(&mut self) -> Vec<Action<C>> {
        if self.is_leader() {
            debug!(peer = %self.id, "election timeout ignored while leader");
            return Vec::new();
        }
        self.start_election()
    }

    fn start_election(&mut self) -> Vec<Action<C>> {
        let mut actions = Vec::new();

        self.persistent.current_term = self.persistent.current_term.increment();
        self.persistent.voted_for = Some(self.id);
        self.set_role(Role::Candidate(Candidate::new(self.id)), &mut actions);

        let term = self.persistent.current_term;
        let commit_index = self.volatile.commit_index;
        info!(peer = %self.id, term = %term, "attempting election");

        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: commit_index,
            last_log_term: self.persistent.log.term_at(commit_index).unwrap_or(Term::ZERO),
        };
        for peer in self.others() {
            actions.push(Action::RequestVote {
                to: peer,
                generation: self.generation,
                args: request.clone(),
            });
        }
        actions.push(Action::ResetElectionTimer);

        if let Role::Candidate(candidate) = &self.role {
            if candidate.has_majority(self.cluster_size) {
                self.become_leader(&mut actions);
            }
        }
        actions
    }

    /// Answer a request-vote call.
    pub fn handle_request_vote(&mut self, args: RequestVote) -> (RequestVoteReply, Vec<Action<C>>) {
        let mut actions = Vec::new();
        debug!(
            peer = %self.id,
            candidate = %args.candidate_id,
            term = %args.term,
            current = %self.persistent.current_term,
            "vote requested"
        );

        if !self.started {
            debug!(peer = %self.id, "not started yet, refusing vote");
            return (self.vote_reply(false), actions);
        }
        if args.term < self.persistent.current_term {
            return (self.vote_reply(false), actions);
        }

        // The log-currency proof is compared against the term held before
        // this request was seen.
        let own_term = self.persistent.current_term;
        self.ensure_term(args.term, &mut actions);

        let log_current = args.last_log_index >= self.volatile.commit_index
            && args.last_log_term >= own_term;
        let grant = match self.persistent.voted_for {
            None => true,
            Some(voted) => voted == args.candidate_id && log_current,
        };

        if grant {
            self.persistent.voted_for = Some(args.candidate_id);
            self.persistent.current_term = args.term;
            debug!(peer = %self.id, candidate = %args.candidate_id, term = %args.term, "vote granted");
        }
        (self.vote_reply(grant), actions)
    }

    fn vote_reply(&self, vote_granted: bool) -> RequestVoteReply {
        RequestVoteReply {
            term: self.persistent.current_term,
            vote_granted,
        }
    }

    /// Outcome of a request-vote call issued under `generation`.
    /// `None` means the peer could not be reached.
    pub fn handle_vote_reply(
        &mut self,
        from: PeerId,
        generation: Generation,
        reply: Option<RequestVoteReply>,
    ) -> Vec<Action<C>> {
        let mut actions = Vec::new();
        let Some(reply) = reply else {
            debug!(peer = %self.id, voter = %from, "vote request failed, counting as no vote");
            return actions;
        };

        self.ensure_term(reply.term, &mut actions);
        if !reply.vote_granted {
            debug!(peer = %self.id, voter = %from, "vote not granted");
            return actions;
        }
        if generation != self.generation {
            debug!(peer = %self.id, voter = %from, "vote arrived after the election finished");
            return actions;
        }

        let cluster_size = self.cluster_size;
        let Role::Candidate(candidate) = &mut self.role else {
            return actions;
        };
        candidate.record_vote(from);
        if candidate.has_majority(cluster_size) {
            info!(
                peer = %self.id,
                voter = %from,
                term = %self.persistent.current_term,
                "received final vote"
            );
            self.become_leader(&mut actions);
        } else {
            debug!(peer = %self.id, voter = %from, votes = candidate.votes(), "not enough votes yet");
        }
        actions
    }

    fn become_leader(&mut self, actions: &mut Vec<Action<C>>) {
        let leader = Leader::new(self.cluster_size, self.persistent.log.len());
        self.set_role(Role::Leader(leader), actions);
        actions.push(Action::CancelElectionTimer);
        self.broadcast_heartbeat(actions);
        actions.push(Action::ScheduleHeartbeat);
    }

    // ---------------------------------------------------------------------
    // Replication: leader side
    // ---------------------------------------------------------------------

    /// Heartbeat timer fired. Only a leader sends and re-arms it.
    pub fn heartbeat_timeout(&mut self) -> Vec<Action<C>> {
        let mut actions = Vec::new();
        if !self.is_leader() {
            debug!(peer = %self.id, "stop heartbeat because not leader anymore");
            return actions;
        }
        self.broadcast_heartbeat(&mut actions);
        actions.push(Action::ScheduleHeartbeat);
        actions
    }

    fn broadcast_heartbeat(&self, actions: &mut Vec<Action<C>>) {
        let last = self.persistent.log.last_index();
        for peer in self.others() {
            if let Some(action) = self.append_action(peer, Round::Heartbeat, last) {
                actions.push(action);
            }
        }
    }

    /// Agreement call for `agreement` to `to`, sending up to commitIndex + 1.
    fn replicate_action(&self, to: PeerId, agreement: LogIndex, cursor: LogIndex) -> Option<Action<C>> {
        let last = self
            .volatile
            .commit_index
            .next()
            .min(self.persistent.log.last_index());
        self.append_action(to, Round::Replicate { agreement, cursor }, last)
    }

    /// Build an append-entries call carrying `next_index[to]..=last`.
    fn append_action(&self, to: PeerId, round: Round, last: LogIndex) -> Option<Action<C>> {
        let Role::Leader(leader) = &self.role else {
            return None;
        };
        let next = leader.next_index_for(to)?;
        let entries = self.persistent.log.slice(next, last);
        let last_sent = if entries.is_empty() {
            None
        } else {
            let first = next.to_array_index().unwrap_or(0);
            Some(LogIndex::from(first + entries.len() - 1))
        };
        let prev_log_index = next.prev();

        Some(Action::AppendEntries {
            to,
            context: AppendContext {
                generation: self.generation,
                round,
                last_sent,
            },
            args: AppendEntries {
                term: self.persistent.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term: self.persistent.log.term_at(prev_log_index),
                entries,
                leader_commit: self.volatile.commit_index,
            },
        })
    }

    /// Outcome of an append-entries call. `None` means the peer could not be
    /// reached; cursors stay put and the next round tries again.
    pub fn handle_append_reply(
        &mut self,
        from: PeerId,
        context: AppendContext,
        reply: Option<AppendEntriesReply>,
    ) -> Vec<Action<C>> {
        let mut actions = Vec::new();
        let Some(reply) = reply else {
            debug!(peer = %self.id, follower = %from, round = ?context.round, "append-entries unreachable");
            return actions;
        };

        self.ensure_term(reply.term, &mut actions);
        if context.generation != self.generation || !self.is_leader() {
            debug!(peer = %self.id, follower = %from, "discarding stale append-entries reply");
            return actions;
        }

        if reply.success {
            // Any successful append acknowledges the agreements it covers,
            // heartbeats included.
            let mut acknowledged = Vec::new();
            if let Role::Leader(leader) = &mut self.role {
                if let Some(last_sent) = context.last_sent {
                    leader.record_success(from, last_sent);
                }
                acknowledged = leader.agreements_matched_by(from);
            }
            if let Round::Replicate { agreement, .. } = context.round {
                if !acknowledged.contains(&agreement) {
                    acknowledged.push(agreement);
                }
            }
            for index in acknowledged {
                self.acknowledge(index, from, &mut actions);
            }
            self.check_committed(&mut actions);
            return actions;
        }

        match context.round {
            Round::Heartbeat => {
                if let Role::Leader(leader) = &mut self.role {
                    leader.record_failure(from);
                }
                debug!(peer = %self.id, follower = %from, "heartbeat rejected, nextIndex stepped back");
            }
            Round::Replicate { agreement, cursor } => {
                if cursor > LogIndex::FIRST {
                    if let Role::Leader(leader) = &mut self.role {
                        leader.record_failure(from);
                    }
                    debug!(
                        peer = %self.id,
                        follower = %from,
                        agreement = %agreement,
                        "agreement rejected, trying previous entry"
                    );
                    if let Some(action) = self.replicate_action(from, agreement, cursor.prev()) {
                        actions.push(action);
                    }
                } else {
                    warn!(
                        peer = %self.id,
                        follower = %from,
                        agreement = %agreement,
                        "agreement rejected at the first index, leaving it to the next heartbeat"
                    );
                }
            }
        }
        actions
    }

    /// Commit the highest index that enough peers have matched.
    fn check_committed(&mut self, actions: &mut Vec<Action<C>>) {
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let commit_index = self.volatile.commit_index;
        let candidates: BTreeSet<LogIndex> = leader
            .match_indices()
            .filter(|&index| index > commit_index)
            .collect();

        let mut target = commit_index;
        for value in candidates {
            let count = leader.match_indices().filter(|&index| index >= value).count();
            if count * 2 >= self.cluster_size {
                target = target.max(value);
            }
        }

        if target > commit_index {
            debug!(peer = %self.id, commit_index = %target, "matchIndex majority reached");
            self.advance_commit(target, actions);
        }
    }

    // ---------------------------------------------------------------------
    // Client commands and agreement rounds
    // ---------------------------------------------------------------------

    /// Append a client command if leader and start agreeing on it.
    /// Never blocks; commitment is observed later through applied commands.
    pub fn submit(&mut self, command: C) -> (Submission, Vec<Action<C>>) {
        let term = self.persistent.current_term;
        let mut actions = Vec::new();
        if !self.is_leader() {
            return (
                Submission {
                    index: LogIndex::NONE,
                    term,
                    is_leader: false,
                },
                actions,
            );
        }

        let index = self.persistent.log.append(LogEntry { term, command });
        debug!(peer = %self.id, index = %index, term = %term, "leader appended a new entry");
        if let Role::Leader(leader) = &mut self.role {
            leader.queue_agreement(index);
        }
        self.resume_agreements(&mut actions);

        (
            Submission {
                index,
                term,
                is_leader: true,
            },
            actions,
        )
    }

    /// Start every queued agreement whose predecessor is now committed.
    fn resume_agreements(&mut self, actions: &mut Vec<Action<C>>) {
        loop {
            let commit_index = self.volatile.commit_index;
            let Role::Leader(leader) = &mut self.role else {
                return;
            };
            let Some(index) = leader.first_waiting() else {
                return;
            };
            let previous = index.prev();
            if previous > commit_index {
                debug!(index = %index, commit_index = %commit_index, "previous entry not committed yet");
                return;
            }
            leader.take_waiting(index);
            if previous < commit_index {
                debug!(index = %index, "entry already committed");
                continue;
            }
            self.start_agreement(index, actions);
        }
    }

    fn start_agreement(&mut self, index: LogIndex, actions: &mut Vec<Action<C>>) {
        let (me, cluster_size) = (self.id, self.cluster_size);
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        let reached = leader.open_agreement(index, me).is_reached(cluster_size);
        debug!(peer = %me, index = %index, "starting agreement");

        if reached {
            self.agreement_reached(index, actions);
            return;
        }
        for peer in self.others() {
            if let Some(action) = self.replicate_action(peer, index, index) {
                actions.push(action);
            }
        }
    }

    fn acknowledge(&mut self, index: LogIndex, from: PeerId, actions: &mut Vec<Action<C>>) {
        let cluster_size = self.cluster_size;
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(agreement) = leader.agreement_mut(index) else {
            return;
        };
        if agreement.acknowledge(from) && agreement.is_reached(cluster_size) {
            self.agreement_reached(index, actions);
        }
    }

    fn agreement_reached(&mut self, index: LogIndex, actions: &mut Vec<Action<C>>) {
        info!(peer = %self.id, index = %index, term = %self.persistent.current_term, "agreement reached");
        self.advance_commit(index, actions);
    }

    // ---------------------------------------------------------------------
    // Replication: follower side
    // ---------------------------------------------------------------------

    /// Answer an append-entries call from a leader.
    pub fn handle_append_entries(&mut self, args: AppendEntries<C>) -> (AppendEntriesReply, Vec<Action<C>>) {
        let mut actions = Vec::new();
        debug!(
            peer = %self.id,
            leader = %args.leader_id,
            term = %args.term,
            current = %self.persistent.current_term,
            entries = args.entries.len(),
            prev_log_index = %args.prev_log_index,
            "append-entries received"
        );

        if args.term < self.persistent.current_term {
            return (self.append_reply(false), actions);
        }

        // A current leader exists: fall in line and push the election back.
        let was_follower = matches!(self.role, Role::Follower(_));
        self.ensure_term(args.term, &mut actions);
        if !matches!(self.role, Role::Follower(_)) {
            self.step_down(&mut actions);
        } else if was_follower {
            actions.push(Action::ResetElectionTimer);
        }
        if let Role::Follower(follower) = &mut self.role {
            follower.set_leader(args.leader_id);
        }

        let mut start = 0;
        if let Some(prev) = args.prev_log_index.to_array_index() {
            let Some(local_term) = self.persistent.log.term_at(args.prev_log_index) else {
                debug!(peer = %self.id, prev_log_index = %args.prev_log_index, "log too short");
                return (self.append_reply(false), actions);
            };
            if Some(local_term) == args.prev_log_term {
                start = prev + 1;
            } else {
                debug!(
                    peer = %self.id,
                    prev_log_index = %args.prev_log_index,
                    "conflicting entry, discarding it and everything after"
                );
                self.persistent.log.truncate(prev);
                start = prev;
            }
        }

        if !args.entries.is_empty() {
            self.persistent.log.merge_from(start, args.entries);
        }

        if args.leader_commit > self.volatile.commit_index {
            self.advance_commit(args.leader_commit, &mut actions);
        } else {
            self.apply_committed(&mut actions);
        }

        (
            AppendEntriesReply {
                term: args.term,
                success: true,
            },
            actions,
        )
    }

    fn append_reply(&self, success: bool) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.persistent.current_term,
            success,
        }
    }

    // ---------------------------------------------------------------------
    // Commit and apply
    // ---------------------------------------------------------------------

    /// Raise the commit index to `to` (bounded by the log, never backwards)
    /// and apply everything newly committed.
    fn advance_commit(&mut self, to: LogIndex, actions: &mut Vec<Action<C>>) {
        let target = to.min(self.persistent.log.last_index());
        if target > self.volatile.commit_index {
            debug!(
                peer = %self.id,
                from = %self.volatile.commit_index,
                to = %target,
                "advancing commit index"
            );
            self.volatile.commit_index = target;
        }
        self.apply_committed(actions);

        let commit_index = self.volatile.commit_index;
        if let Role::Leader(leader) = &mut self.role {
            leader.close_agreements_through(commit_index);
        }
        self.resume_agreements(actions);
    }

    /// Deliver `(last_applied, commit_index]` in ascending order.
    fn apply_committed(&mut self, actions: &mut Vec<Action<C>>) {
        while self.volatile.last_applied < self.volatile.commit_index {
            let next = self.volatile.last_applied.next();
            let Some(entry) = self.persistent.log.entry(next) else {
                break;
            };
            actions.push(Action::Apply {
                index: next,
                command: entry.command.clone(),
            });
            self.volatile.last_applied = next;
        }
    }
}
