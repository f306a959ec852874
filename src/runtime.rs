use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::action::{Action, AppendContext};
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::node::{Node, Status};
use crate::peer::Peer;
use crate::state::RoleKind;
use crate::transport::TransportError;
use crate::types::{
    AppendEntries, AppendEntriesReply, Generation, PeerId, RequestVote, RequestVoteReply, Submission,
};

/// Receives committed commands, once per committed entry, in index order.
pub trait StateMachine<C>: Send + 'static {
    fn apply(&mut self, command: C);
}

/// Everything that can happen to a node. Processed one at a time.
enum Event<C> {
    ElectionTimeout {
        epoch: u64,
    },
    HeartbeatTimeout {
        epoch: u64,
    },
    VoteReply {
        from: PeerId,
        generation: Generation,
        reply: Option<RequestVoteReply>,
    },
    AppendReply {
        from: PeerId,
        context: AppendContext,
        reply: Option<AppendEntriesReply>,
    },
    RequestVote {
        args: RequestVote,
        respond: oneshot::Sender<RequestVoteReply>,
    },
    AppendEntries {
        args: AppendEntries<C>,
        respond: oneshot::Sender<AppendEntriesReply>,
    },
    Submit {
        command: C,
        respond: oneshot::Sender<Submission>,
    },
    Status {
        respond: oneshot::Sender<Status>,
    },
    Shutdown,
}

struct Timing {
    election_timeout: Duration,
    heartbeat_interval: Duration,
    rpc_timeout: Duration,
}

/// Owns the node and executes the actions it produces.
///
/// Peer calls run as independent tasks that report back through the event
/// channel; timers are tasks tagged with an epoch so that a cancelled timer
/// firing late is recognized and dropped.
struct Driver<C, S> {
    node: Node<C>,
    peers: Arc<Vec<Peer<C>>>,
    state_machine: S,
    events: mpsc::UnboundedSender<Event<C>>,
    role: watch::Sender<RoleKind>,
    timing: Timing,
    election_epoch: u64,
    heartbeat_epoch: u64,
}

impl<C, S> Driver<C, S>
where
    C: Clone + Send + 'static,
    S: StateMachine<C>,
{
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Event<C>>) {
        while let Some(event) = inbox.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        info!(peer = %self.node.id, "consensus driver stopped");
    }

    /// Returns false once the driver should stop.
    fn handle(&mut self, event: Event<C>) -> bool {
        match event {
            Event::ElectionTimeout { epoch } => {
                if epoch == self.election_epoch {
                    let actions = self.node.election_timeout();
                    self.execute(actions);
                }
            }
            Event::HeartbeatTimeout { epoch } => {
                if epoch == self.heartbeat_epoch {
                    let actions = self.node.heartbeat_timeout();
                    self.execute(actions);
                }
            }
            Event::VoteReply {
                from,
                generation,
                reply,
            } => {
                let actions = self.node.handle_vote_reply(from, generation, reply);
                self.execute(actions);
            }
            Event::AppendReply {
                from,
                context,
                reply,
            } => {
                let actions = self.node.handle_append_reply(from, context, reply);
                self.execute(actions);
            }
            Event::RequestVote { args, respond } => {
                let (reply, actions) = self.node.handle_request_vote(args);
                self.execute(actions);
                let _ = respond.send(reply);
            }
            Event::AppendEntries { args, respond } => {
                let (reply, actions) = self.node.handle_append_entries(args);
                self.execute(actions);
                let _ = respond.send(reply);
            }
            Event::Submit { command, respond } => {
                let (submission, actions) = self.node.submit(command);
                self.execute(actions);
                let _ = respond.send(submission);
            }
            Event::Status { respond } => {
                let _ = respond.send(self.node.status());
            }
            Event::Shutdown => return false,
        }
        true
    }

    fn execute(&mut self, actions: Vec<Action<C>>) {
        for action in actions {
            match action {
                Action::RequestVote {
                    to,
                    generation,
                    args,
                } => self.send_request_vote(to, generation, args),
                Action::AppendEntries { to, context, args } => {
                    self.send_append_entries(to, context, args)
                }
                Action::ResetElectionTimer => {
                    self.election_epoch += 1;
                    let epoch = self.election_epoch;
                    self.schedule(self.timing.election_timeout, Event::ElectionTimeout { epoch });
                }
                Action::CancelElectionTimer => self.election_epoch += 1,
                Action::ScheduleHeartbeat => {
                    self.heartbeat_epoch += 1;
                    let epoch = self.heartbeat_epoch;
                    self.schedule(self.timing.heartbeat_interval, Event::HeartbeatTimeout { epoch });
                }
                Action::CancelHeartbeat => self.heartbeat_epoch += 1,
                Action::Apply { index, command } => {
                    debug!(peer = %self.node.id, index = %index, "applying committed command");
                    self.state_machine.apply(command);
                }
                Action::RoleChanged(role) => {
                    self.role.send_replace(role);
                }
            }
        }
    }

    fn schedule(&self, delay: Duration, event: Event<C>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn send_request_vote(&self, to: PeerId, generation: Generation, args: RequestVote) {
        let Some(peer) = self.peers.get(to.index()).cloned() else {
            warn!(peer = %to, "no such peer");
            return;
        };
        let events = self.events.clone();
        let timeout = self.timing.rpc_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, peer.request_vote(args)).await;
            let reply = settle(to, "request-vote", timeout, result);
            let _ = events.send(Event::VoteReply {
                from: to,
                generation,
                reply,
            });
        });
    }

    fn send_append_entries(&self, to: PeerId, context: AppendContext, args: AppendEntries<C>) {
        let Some(peer) = self.peers.get(to.index()).cloned() else {
            warn!(peer = %to, "no such peer");
            return;
        };
        let events = self.events.clone();
        let timeout = self.timing.rpc_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, peer.append_entries(args)).await;
            let reply = settle(to, "append-entries", timeout, result);
            let _ = events.send(Event::AppendReply {
                from: to,
                context,
                reply,
            });
        });
    }
}

/// Collapse transport failures and timeouts into "no answer".
fn settle<T>(
    to: PeerId,
    rpc: &str,
    timeout: Duration,
    result: std::result::Result<std::result::Result<T, TransportError>, tokio::time::error::Elapsed>,
) -> Option<T> {
    match result {
        Ok(Ok(reply)) => Some(reply),
        Ok(Err(error)) => {
            debug!(peer = %to, rpc, %error, "call failed");
            None
        }
        Err(_) => {
            debug!(peer = %to, rpc, ?timeout, "call timed out");
            None
        }
    }
}

/// Handle to a running consensus node.
///
/// Cheap to clone. Every call goes through the node's event loop; once the
/// loop has exited calls fail with [`RaftError::Stopped`].
pub struct Raft<C> {
    me: PeerId,
    events: mpsc::UnboundedSender<Event<C>>,
    role: watch::Receiver<RoleKind>,
    peers: Arc<Vec<Peer<C>>>,
}

impl<C> Clone for Raft<C> {
    fn clone(&self) -> Self {
        Self {
            me: self.me,
            events: self.events.clone(),
            role: self.role.clone(),
            peers: Arc::clone(&self.peers),
        }
    }
}

impl<C> Raft<C>
where
    C: Clone + Send + 'static,
{
    /// Start the node at position `me` of `peers` and arm its election timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<S>(peers: Vec<Peer<C>>, me: PeerId, state_machine: S, config: &RaftConfig) -> Result<Self>
    where
        S: StateMachine<C>,
    {
        config.validate()?;
        if me.index() >= peers.len() {
            return Err(RaftError::Config(format!(
                "own index {me} is outside the peer list of {}",
                peers.len()
            )));
        }

        let election_timeout = config.draw_election_timeout();
        info!(
            peer = %me,
            cluster_size = peers.len(),
            election_timeout_ms = election_timeout.as_millis() as u64,
            "starting consensus driver"
        );

        let (events, inbox) = mpsc::unbounded_channel();
        let (role_tx, role_rx) = watch::channel(RoleKind::Follower);
        let peers = Arc::new(peers);

        let mut driver = Driver {
            node: Node::new(me, peers.len()),
            peers: Arc::clone(&peers),
            state_machine,
            events: events.clone(),
            role: role_tx,
            timing: Timing {
                election_timeout,
                heartbeat_interval: config.heartbeat_interval(),
                rpc_timeout: config.rpc_timeout(),
            },
            election_epoch: 0,
            heartbeat_epoch: 0,
        };
        let actions = driver.node.start();
        driver.execute(actions);
        tokio::spawn(driver.run(inbox));

        Ok(Self {
            me,
            events,
            role: role_rx,
            peers,
        })
    }

    pub fn me(&self) -> PeerId {
        self.me
    }

    /// Receiver that observes every role transition.
    pub fn subscribe_role(&self) -> watch::Receiver<RoleKind> {
        self.role.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.events.is_closed()
    }

    /// Submit a client command. Does not wait for it to commit.
    pub async fn submit(&self, command: C) -> Result<Submission> {
        self.call(|respond| Event::Submit { command, respond }).await
    }

    /// Handle an inbound request-vote call.
    pub async fn request_vote(&self, args: RequestVote) -> Result<RequestVoteReply> {
        self.call(|respond| Event::RequestVote { args, respond }).await
    }

    /// Handle an inbound append-entries call.
    pub async fn append_entries(&self, args: AppendEntries<C>) -> Result<AppendEntriesReply> {
        self.call(|respond| Event::AppendEntries { args, respond }).await
    }

    pub async fn status(&self) -> Result<Status> {
        self.call(|respond| Event::Status { respond }).await
    }

    /// Put this instance into service and every other member out of it.
    pub async fn take_into_service(&self) -> Result<()> {
        for (index, peer) in self.peers.iter().enumerate() {
            if index == self.me.index() {
                peer.take_into_service().await?;
            } else {
                peer.take_out_of_service().await?;
            }
        }
        Ok(())
    }

    pub async fn take_out_of_service(&self) -> Result<()> {
        let Some(own) = self.peers.get(self.me.index()) else {
            return Err(RaftError::Config(format!("own index {} has no peer entry", self.me)));
        };
        own.take_out_of_service().await?;
        Ok(())
    }

    /// Stop the event loop. Pending timers and peer calls become no-ops.
    pub fn shutdown(&self) {
        if self.events.send(Event::Shutdown).is_err() {
            debug!(peer = %self.me, "consensus driver already stopped");
        }
    }

    async fn call<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> Event<C>) -> Result<T> {
        let (respond, reply) = oneshot::channel();
        self.events
            .send(event(respond))
            .map_err(|_| RaftError::Stopped)?;
        reply.await.map_err(|_| RaftError::Stopped)
    }
}
