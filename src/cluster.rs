use std::collections::{BTreeSet, VecDeque};

use crate::action::{Action, AppendContext};
use crate::node::{Node, Role};
use crate::types::{
    AppendEntries, AppendEntriesReply, Generation, LogIndex, PeerId, RequestVote, RequestVoteReply,
    Submission,
};

/// A call or reply in flight between nodes.
#[derive(Clone)]
enum Packet<C> {
    RequestVote {
        from: PeerId,
        to: PeerId,
        generation: Generation,
        args: RequestVote,
    },
    VoteReply {
        from: PeerId,
        to: PeerId,
        generation: Generation,
        reply: Option<RequestVoteReply>,
    },
    AppendEntries {
        from: PeerId,
        to: PeerId,
        context: AppendContext,
        args: AppendEntries<C>,
    },
    AppendReply {
        from: PeerId,
        to: PeerId,
        context: AppendContext,
        reply: Option<AppendEntriesReply>,
    },
}

/// Simulated cluster for testing.
///
/// Timers never fire on their own: tests trigger timeouts explicitly and
/// decide when packets are delivered. A call to or from an isolated node
/// comes back as unreachable.
pub struct Cluster<C> {
    nodes: Vec<Node<C>>,
    applied: Vec<Vec<(LogIndex, C)>>,
    packets: VecDeque<Packet<C>>,
    isolated: BTreeSet<usize>,
}

impl<C: Clone> Cluster<C> {
    /// Create a cluster of started nodes, all followers in term 0.
    pub fn new(size: usize) -> Self {
        let nodes = (0..size)
            .map(|index| {
                let mut node = Node::new(PeerId::from(index), size);
                node.start();
                node
            })
            .collect();

        Self {
            nodes,
            applied: vec![Vec::new(); size],
            packets: VecDeque::new(),
            isolated: BTreeSet::new(),
        }
    }

    pub fn node(&self, index: usize) -> &Node<C> {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Node<C> {
        &mut self.nodes[index]
    }

    /// Commands applied by a node, in application order.
    pub fn applied(&self, index: usize) -> &[(LogIndex, C)] {
        &self.applied[index]
    }

    pub fn election_timeout(&mut self, index: usize) {
        let actions = self.nodes[index].election_timeout();
        self.execute(index, actions);
    }

    pub fn heartbeat_timeout(&mut self, index: usize) {
        let actions = self.nodes[index].heartbeat_timeout();
        self.execute(index, actions);
    }

    pub fn submit(&mut self, index: usize, command: C) -> Submission {
        let (submission, actions) = self.nodes[index].submit(command);
        self.execute(index, actions);
        submission
    }

    /// Cut a node off from everyone else.
    pub fn isolate(&mut self, index: usize) {
        self.isolated.insert(index);
    }

    pub fn heal(&mut self, index: usize) {
        self.isolated.remove(&index);
    }

    pub fn pending(&self) -> usize {
        self.packets.len()
    }

    /// Queue a second copy of every packet in flight.
    pub fn duplicate_pending(&mut self) {
        let copies: Vec<_> = self.packets.iter().cloned().collect();
        self.packets.extend(copies);
    }

    /// Deliver packets until none are left, including those produced on the way.
    pub fn deliver_all(&mut self) {
        while let Some(packet) = self.packets.pop_front() {
            self.deliver(packet);
        }
    }

    fn reachable(&self, a: PeerId, b: PeerId) -> bool {
        !self.isolated.contains(&a.index()) && !self.isolated.contains(&b.index())
    }

    fn deliver(&mut self, packet: Packet<C>) {
        match packet {
            Packet::RequestVote {
                from,
                to,
                generation,
                args,
            } => {
                let reply = if self.reachable(from, to) {
                    let (reply, actions) = self.nodes[to.index()].handle_request_vote(args);
                    self.execute(to.index(), actions);
                    Some(reply)
                } else {
                    None
                };
                self.packets.push_back(Packet::VoteReply {
                    from: to,
                    to: from,
                    generation,
                    reply,
                });
            }
            Packet::VoteReply {
                from,
                to,
                generation,
                reply,
            } => {
                let actions = self.nodes[to.index()].handle_vote_reply(from, generation, reply);
                self.execute(to.index(), actions);
            }
            Packet::AppendEntries {
                from,
                to,
                context,
                args,
            } => {
                let reply = if self.reachable(from, to) {
                    let (reply, actions) = self.nodes[to.index()].handle_append_entries(args);
                    self.execute(to.index(), actions);
                    Some(reply)
                } else {
                    None
                };
                self.packets.push_back(Packet::AppendReply {
                    from: to,
                    to: from,
                    context,
                    reply,
                });
            }
            Packet::AppendReply {
                from,
                to,
                context,
                reply,
            } => {
                let actions = self.nodes[to.index()].handle_append_reply(from, context, reply);
                self.execute(to.index(), actions);
            }
        }
    }

    /// Queue outgoing calls and record applied commands. Timer actions are
    /// ignored; tests fire timeouts themselves.
    fn execute(&mut self, index: usize, actions: Vec<Action<C>>) {
        let from = PeerId::from(index);
        for action in actions {
            match action {
                Action::RequestVote {
                    to,
                    generation,
                    args,
                } => self.packets.push_back(Packet::RequestVote {
                    from,
                    to,
                    generation,
                    args,
                }),
                Action::AppendEntries { to, context, args } => {
                    self.packets.push_back(Packet::AppendEntries {
                        from,
                        to,
                        context,
                        args,
                    })
                }
                Action::Apply { index: at, command } => self.applied[index].push((at, command)),
                Action::ResetElectionTimer
                | Action::CancelElectionTimer
                | Action::ScheduleHeartbeat
                | Action::CancelHeartbeat
                | Action::RoleChanged(_) => {}
            }
        }
    }

    /// Find the current leader, if exactly one node believes it leads.
    pub fn leader(&self) -> Option<usize> {
        let leaders: Vec<usize> = (0..self.nodes.len())
            .filter(|&index| self.nodes[index].is_leader())
            .collect();
        match leaders.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Count nodes in each role: (followers, candidates, leaders).
    pub fn role_counts(&self) -> (usize, usize, usize) {
        let mut followers = 0;
        let mut candidates = 0;
        let mut leaders = 0;

        for node in &self.nodes {
            match node.role {
                Role::Follower(_) => followers += 1,
                Role::Candidate(_) => candidates += 1,
                Role::Leader(_) => leaders += 1,
            }
        }

        (followers, candidates, leaders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RoleKind;
    use crate::types::{LogEntry, Term};

    fn commands(cluster: &Cluster<String>, index: usize) -> Vec<&str> {
        cluster
            .applied(index)
            .iter()
            .map(|(_, command)| command.as_str())
            .collect()
    }

    fn log_terms(cluster: &Cluster<String>, index: usize) -> Vec<u64> {
        cluster
            .node(index)
            .persistent
            .log
            .entries()
            .iter()
            .map(|entry| entry.term.get())
            .collect()
    }

    fn seed(cluster: &mut Cluster<String>, index: usize, terms: &[u64]) {
        let node = cluster.node_mut(index);
        for (position, &term) in terms.iter().enumerate() {
            node.persistent.log.append(LogEntry {
                term: Term::from(term),
                command: format!("{index}:{position}"),
            });
        }
    }

    #[test]
    fn single_node_becomes_leader() {
        let mut cluster: Cluster<String> = Cluster::new(1);

        cluster.election_timeout(0);

        assert_eq!(cluster.leader(), Some(0));
    }

    #[test]
    fn three_node_leader_election() {
        let mut cluster: Cluster<String> = Cluster::new(3);

        cluster.election_timeout(0);
        assert_eq!(cluster.role_counts(), (2, 1, 0));
        assert_eq!(cluster.node(0).current_term(), Term::from(1));

        cluster.deliver_all();

        assert_eq!(cluster.leader(), Some(0));
        assert_eq!(cluster.role_counts(), (2, 0, 1));
        let leader = cluster.node(0).leader().expect("leader state");
        for peer in 0..3 {
            assert_eq!(leader.next_index_for(PeerId::from(peer)), Some(LogIndex::new(0)));
            assert_eq!(leader.match_index_for(PeerId::from(peer)), Some(LogIndex::NONE));
        }
        for follower in 1..3 {
            assert_eq!(cluster.node(follower).persistent.voted_for, Some(PeerId::from(0)));
            assert_eq!(cluster.node(follower).status().leader_id, Some(PeerId::from(0)));
        }
    }

    #[test]
    fn leader_of_term_three_replicates_command_exactly_once() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        for _ in 0..3 {
            cluster.election_timeout(0);
        }
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(0));
        assert_eq!(cluster.node(0).current_term(), Term::from(3));

        let submission = cluster.submit(0, "C".to_string());
        assert!(submission.is_leader);
        assert_eq!(submission.index, LogIndex::new(0));
        assert_eq!(submission.term, Term::from(3));
        cluster.deliver_all();

        let leader = cluster.node(0).leader().expect("leader state");
        assert_eq!(leader.match_index_for(PeerId::from(1)), Some(LogIndex::new(0)));
        assert_eq!(leader.match_index_for(PeerId::from(2)), Some(LogIndex::new(0)));
        assert_eq!(cluster.node(0).commit_index(), LogIndex::new(0));
        assert_eq!(commands(&cluster, 0), vec!["C"]);

        // Followers learn the commit index from the next heartbeat.
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        for node in 0..3 {
            assert_eq!(cluster.applied(node), &[(LogIndex::new(0), "C".to_string())]);
            assert_eq!(cluster.node(node).commit_index(), LogIndex::new(0));
        }
    }

    #[test]
    fn submissions_commit_in_order() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        cluster.election_timeout(0);
        cluster.deliver_all();

        for command in ["a", "b", "c"] {
            cluster.submit(0, command.to_string());
        }
        cluster.deliver_all();
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        for node in 0..3 {
            assert_eq!(commands(&cluster, node), vec!["a", "b", "c"]);
        }
        assert_eq!(cluster.node(0).commit_index(), LogIndex::new(2));
        assert_eq!(cluster.node(0).leader().map(|l| l.open_agreements()), Some(0));
    }

    #[test]
    fn majority_match_commits_entries_from_earlier_terms() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        cluster.node_mut(0).persistent.current_term = Term::from(1);
        seed(&mut cluster, 0, &[1, 1]);

        cluster.election_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(0));
        for _ in 0..4 {
            cluster.heartbeat_timeout(0);
            cluster.deliver_all();
        }

        // Nothing was submitted, so only matchIndex can have moved the commit.
        let leader = cluster.node(0).leader().expect("leader state");
        assert_eq!(leader.open_agreements(), 0);
        assert_eq!(leader.match_index_for(PeerId::from(1)), Some(LogIndex::new(1)));
        assert_eq!(leader.match_index_for(PeerId::from(2)), Some(LogIndex::new(1)));
        for node in 0..3 {
            assert_eq!(cluster.node(node).commit_index(), LogIndex::new(1));
            assert_eq!(commands(&cluster, node), vec!["0:0", "0:1"]);
        }
    }

    #[test]
    fn one_matching_follower_does_not_commit_earlier_entries() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        cluster.node_mut(0).persistent.current_term = Term::from(1);
        seed(&mut cluster, 0, &[1]);

        cluster.election_timeout(0);
        cluster.deliver_all();
        cluster.isolate(2);
        for _ in 0..4 {
            cluster.heartbeat_timeout(0);
            cluster.deliver_all();
        }

        let leader = cluster.node(0).leader().expect("leader state");
        assert_eq!(leader.match_index_for(PeerId::from(1)), Some(LogIndex::new(0)));
        assert_eq!(cluster.node(0).commit_index(), LogIndex::NONE);
        assert!(cluster.applied(0).is_empty());
    }

    #[test]
    fn submit_to_follower_is_refused() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        cluster.election_timeout(0);
        cluster.deliver_all();

        let submission = cluster.submit(1, "x".to_string());

        assert!(!submission.is_leader);
        assert_eq!(submission.index, LogIndex::NONE);
        assert_eq!(submission.term, Term::from(1));
        assert!(cluster.node(1).persistent.log.is_empty());
        assert_eq!(cluster.pending(), 0);
    }

    #[test]
    fn follower_discards_conflicting_suffix() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        seed(&mut cluster, 0, &[1, 1, 1, 1, 1, 3]);
        seed(&mut cluster, 1, &[1, 1, 1, 1, 1, 2]);
        seed(&mut cluster, 2, &[1, 1, 1, 1, 1, 3]);

        // The winning heartbeat carries prevLogIndex 5 with term 3.
        cluster.election_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(0));

        assert_eq!(log_terms(&cluster, 1), vec![1, 1, 1, 1, 1]);
        assert_eq!(log_terms(&cluster, 2), vec![1, 1, 1, 1, 1, 3]);
        assert_eq!(log_terms(&cluster, 0), vec![1, 1, 1, 1, 1, 3]);

        // Rejected once for the now missing index, then repaired.
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        assert_eq!(log_terms(&cluster, 1), vec![1, 1, 1, 1, 1, 3]);
        assert_eq!(cluster.node(1).persistent.log.entries()[5].command, "0:5");
        let leader = cluster.node(0).leader().expect("leader state");
        assert_eq!(leader.match_index_for(PeerId::from(1)), Some(LogIndex::new(5)));
    }

    #[test]
    fn repeated_delivery_is_idempotent() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        cluster.election_timeout(0);
        cluster.deliver_all();
        cluster.submit(0, "x".to_string());
        cluster.deliver_all();

        cluster.heartbeat_timeout(0);
        cluster.duplicate_pending();
        cluster.deliver_all();
        cluster.heartbeat_timeout(0);
        cluster.duplicate_pending();
        cluster.deliver_all();

        for node in 0..3 {
            assert_eq!(cluster.node(node).persistent.log.len(), 1);
            assert_eq!(cluster.node(node).commit_index(), LogIndex::new(0));
            assert_eq!(commands(&cluster, node), vec!["x"]);
        }
    }

    #[test]
    fn isolated_candidate_never_wins_but_deposes_leader() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        cluster.election_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(0));

        cluster.isolate(2);
        for _ in 0..3 {
            cluster.election_timeout(2);
            cluster.deliver_all();
        }
        assert_eq!(cluster.node(2).role_kind(), RoleKind::Candidate);
        assert_eq!(cluster.node(2).current_term(), Term::from(4));
        assert_eq!(cluster.leader(), Some(0));

        cluster.heal(2);
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        // The isolated node's higher term wins over the stale leader.
        assert_eq!(cluster.node(0).role_kind(), RoleKind::Follower);
        assert_eq!(cluster.node(0).current_term(), Term::from(4));
        assert_eq!(cluster.leader(), None);

        cluster.election_timeout(2);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(2));
        assert_eq!(cluster.node(2).current_term(), Term::from(5));
    }

    #[test]
    fn newer_term_is_never_undone_by_older_leader() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        cluster.election_timeout(0);
        cluster.deliver_all();

        // Node 1 takes over in term 2 while node 0 is cut off.
        cluster.isolate(0);
        cluster.election_timeout(1);
        cluster.deliver_all();
        assert_eq!(cluster.node(1).current_term(), Term::from(2));
        assert!(cluster.node(1).is_leader());
        assert!(cluster.node(0).is_leader());

        // The deposed leader's term-1 claim is refused by term-2 nodes.
        let (reply, _) = cluster.node_mut(2).handle_append_entries(AppendEntries {
            term: Term::from(1),
            leader_id: PeerId::from(0),
            prev_log_index: LogIndex::NONE,
            prev_log_term: None,
            entries: Vec::new(),
            leader_commit: LogIndex::NONE,
        });
        assert!(!reply.success);
        assert_eq!(reply.term, Term::from(2));
        assert_eq!(cluster.node(2).status().leader_id, Some(PeerId::from(1)));

        let (vote, _) = cluster.node_mut(2).handle_request_vote(RequestVote {
            term: Term::from(1),
            candidate_id: PeerId::from(0),
            last_log_index: LogIndex::NONE,
            last_log_term: Term::ZERO,
        });
        assert!(!vote.vote_granted);

        cluster.heal(0);
        cluster.heartbeat_timeout(1);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(1));
        assert_eq!(cluster.node(0).current_term(), Term::from(2));
    }

    #[test]
    fn unreachable_followers_block_commit() {
        let mut cluster: Cluster<String> = Cluster::new(3);
        cluster.election_timeout(0);
        cluster.deliver_all();

        cluster.isolate(1);
        cluster.isolate(2);
        cluster.submit(0, "lost".to_string());
        cluster.deliver_all();

        assert_eq!(cluster.node(0).commit_index(), LogIndex::NONE);
        assert!(cluster.applied(0).is_empty());

        cluster.heal(1);
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        assert_eq!(cluster.node(0).commit_index(), LogIndex::new(0));
        assert_eq!(commands(&cluster, 0), vec!["lost"]);
    }
}
