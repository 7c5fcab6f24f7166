//! # server
//!
//! why: run a raft node with real timers and concurrent rpcs without sharing its state
//! relations: owns a raft_core::RaftNode; talks to peers through transport.rs
//! what: RaftServer actor task, RaftHandle client api, Proposal completion futures
//!
//! every input (rpc, proposal, admin query, rpc result, timer) becomes an
//! event on one channel and is handled to completion before the next.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, Command, CommandRecord, CommandRegistry,
    MembershipChange, NodeId, NodeState, NodeStatus, Outbound, PeerInfo, RaftError, RaftMessage,
    RaftNode, Result, SnapshotRequest, SnapshotResponse, StateMachine, VoteRequest, VoteResponse,
};
use raft_storage::FileStorage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::transport::{RpcHandler, Transport, TransportError};

const EVENT_QUEUE: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T>>;
type ReadFn<S> = Box<dyn FnOnce(&S) + Send>;

enum Event<S> {
    Vote {
        request: VoteRequest,
        reply: Reply<VoteResponse>,
    },
    Append {
        request: AppendEntriesRequest,
        reply: Reply<AppendEntriesResponse>,
    },
    Snapshot {
        request: SnapshotRequest,
        reply: Reply<SnapshotResponse>,
    },
    VoteResult {
        from: NodeId,
        result: std::result::Result<VoteResponse, TransportError>,
    },
    AppendResult {
        from: NodeId,
        term: u64,
        result: std::result::Result<AppendEntriesResponse, TransportError>,
    },
    SnapshotResult {
        from: NodeId,
        term: u64,
        result: std::result::Result<SnapshotResponse, TransportError>,
    },
    Propose {
        record: CommandRecord,
        reply: Reply<Proposal>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Compact {
        reply: Reply<bool>,
    },
    Read {
        read: ReadFn<S>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// An entry accepted by the leader and persisted in its log
#[derive(Debug)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
    done: oneshot::Receiver<Result<()>>,
}

impl Proposal {
    /// Wait until the entry is applied, or learn why it never will be
    pub async fn committed(self) -> Result<()> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(RaftError::CommandFailed {
                index: self.index,
                term: self.term,
                reason: "node stopped".to_string(),
            }),
        }
    }
}

/// Cloneable client of a running node
pub struct RaftHandle<S> {
    id: NodeId,
    events: mpsc::Sender<Event<S>>,
}

impl<S> Clone for RaftHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: StateMachine> RaftHandle<S> {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> Event<S>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(event(tx))
            .await
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    /// Append a command; resolves once the leader has persisted it
    pub async fn propose(&self, command: &dyn Command<S>) -> Result<Proposal> {
        self.propose_record(command.to_record()?).await
    }

    pub async fn propose_record(&self, record: CommandRecord) -> Result<Proposal> {
        self.call(|reply| Event::Propose { record, reply }).await?
    }

    /// Propose and wait for the entry to be applied; returns its index
    pub async fn propose_and_wait(&self, command: &dyn Command<S>) -> Result<u64> {
        let proposal = self.propose(command).await?;
        let index = proposal.index;
        proposal.committed().await?;
        Ok(index)
    }

    pub async fn add_peer(&self, info: PeerInfo) -> Result<Proposal> {
        self.propose_record(MembershipChange::join(info).to_record()?)
            .await
    }

    pub async fn remove_peer(&self, name: &str) -> Result<Proposal> {
        self.propose_record(MembershipChange::leave(name).to_record()?)
            .await
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.call(|reply| Event::Status { reply }).await
    }

    /// Snapshot the state machine and drop the applied prefix of the log
    pub async fn compact(&self) -> Result<bool> {
        self.call(|reply| Event::Compact { reply }).await?
    }

    /// Run `f` against the state machine between two events
    pub async fn read<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&S) -> R + Send + 'static,
    {
        self.call(|reply: oneshot::Sender<R>| Event::Read {
            read: Box::new(move |state: &S| {
                let _ = reply.send(f(state));
            }),
        })
        .await
    }

    /// Stop the node; proposals still waiting fail
    pub async fn stop(&self) -> Result<()> {
        match self.call(|reply| Event::Stop { reply }).await {
            Ok(()) | Err(RaftError::Stopped) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[async_trait]
impl<S: StateMachine> RpcHandler for RaftHandle<S> {
    async fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.call(|reply| Event::Vote { request, reply }).await?
    }

    async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(|reply| Event::Append { request, reply }).await?
    }

    async fn handle_install_snapshot(&self, request: SnapshotRequest) -> Result<SnapshotResponse> {
        self.call(|reply| Event::Snapshot { request, reply }).await?
    }
}

/// A node running on its own task
pub struct RaftServer<S> {
    handle: RaftHandle<S>,
    task: JoinHandle<()>,
}

impl<S: StateMachine> RaftServer<S> {
    /// Spawn the actor for `node`; must be called inside a tokio runtime
    pub fn start(node: RaftNode<S>, transport: Arc<dyn Transport>) -> Result<Self> {
        node.config.validate()?;
        let (sender, events) = mpsc::channel(EVENT_QUEUE);
        let handle = RaftHandle {
            id: node.id.clone(),
            events: sender.clone(),
        };
        let deadline = Instant::now() + node.config.random_election_timeout();
        let known_peers = node.peers.keys().cloned().collect();
        let actor = Actor {
            node,
            known_peers,
            transport,
            events,
            sender: sender.downgrade(),
            waiters: HashMap::new(),
            deadline,
        };
        info!(id = %handle.id, "starting raft node");
        let task = tokio::spawn(actor.run());
        Ok(Self { handle, task })
    }

    /// Open the node persisted under `config.data_dir` and start it
    pub fn open(
        config: &ServerConfig,
        state_machine: S,
        registry: Arc<CommandRegistry<S>>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = FileStorage::open(&config.data_dir)?;
        let mut node = RaftNode::open(
            config.name.clone(),
            config.address.clone(),
            Box::new(storage),
            state_machine,
            registry,
            config.raft.clone(),
        )?;
        // a snapshot already names the members; the config only seeds a fresh node
        if node.log.snapshot().is_none() {
            for peer in &config.peers {
                node.bootstrap_peer(peer.clone());
            }
        }
        Self::start(node, transport)
    }

    pub fn handle(&self) -> RaftHandle<S> {
        self.handle.clone()
    }

    /// Stop the node and wait for its task to finish
    pub async fn shutdown(self) -> Result<()> {
        self.handle.stop().await?;
        if let Err(err) = self.task.await {
            warn!(id = %self.handle.id, error = %err, "raft task ended abnormally");
        }
        Ok(())
    }
}

struct Actor<S: StateMachine> {
    node: RaftNode<S>,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<Event<S>>,
    /// handed to rpc tasks so results come back as events
    sender: mpsc::WeakSender<Event<S>>,
    /// proposal index -> waiting caller
    waiters: HashMap<u64, Reply<()>>,
    /// peers present after the previous event
    known_peers: BTreeSet<NodeId>,
    deadline: Instant,
}

impl<S: StateMachine> Actor<S> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    let before = self.node.state;
                    let stop = self.handle(event);
                    self.after_event(before);
                    if stop {
                        break;
                    }
                }
                _ = sleep_until(self.deadline) => {
                    let before = self.node.state;
                    self.on_timer();
                    self.after_event(before);
                }
            }
            if self.node.is_stopped() {
                break;
            }
        }

        self.node.stop();
        self.resolve_waiters();
        info!(id = %self.node.id, "raft node task finished");
    }

    fn handle(&mut self, event: Event<S>) -> bool {
        match event {
            Event::Vote { request, reply } => {
                let result = self.node.handle_vote_request(&request).map(|(response, reset)| {
                    if reset {
                        self.reset_election_timer();
                    }
                    response
                });
                self.reply(reply, result);
            }
            Event::Append { request, reply } => {
                let result = self.node.handle_append_entries(request).map(|(response, reset)| {
                    if reset {
                        self.reset_election_timer();
                    }
                    response
                });
                self.reply(reply, result);
            }
            Event::Snapshot { request, reply } => {
                let result = self.node.handle_install_snapshot(request).map(|(response, reset)| {
                    if reset {
                        self.reset_election_timer();
                    }
                    response
                });
                self.reply(reply, result);
            }
            Event::VoteResult { from, result } => match result {
                Ok(response) => match self.node.handle_vote_response(&from, &response) {
                    Ok(true) => self.send_all(self.node.broadcast_append_entries()),
                    Ok(false) => {}
                    Err(err) => error!(id = %self.node.id, error = %err, "vote response failed"),
                },
                Err(err) => debug!(id = %self.node.id, peer = %from, error = %err, "vote rpc failed"),
            },
            Event::AppendResult { from, term, result } => match result {
                Ok(response) => {
                    if let Err(err) =
                        self.node
                            .handle_append_entries_response(&from, term, &response)
                    {
                        error!(id = %self.node.id, error = %err, "append response failed");
                    } else if !response.success || self.node.needs_replication(&from) {
                        self.send_to(&from);
                    }
                }
                Err(err) => warn!(id = %self.node.id, peer = %from, error = %err, "append rpc failed"),
            },
            Event::SnapshotResult { from, term, result } => match result {
                Ok(response) => {
                    match self.node.handle_install_snapshot_response(&from, term, &response) {
                        Ok(_) if self.node.needs_replication(&from) => self.send_to(&from),
                        Ok(_) => {}
                        Err(err) => error!(id = %self.node.id, error = %err, "snapshot response failed"),
                    }
                }
                Err(err) => warn!(id = %self.node.id, peer = %from, error = %err, "snapshot rpc failed"),
            },
            Event::Propose { record, reply } => match self.node.propose(record) {
                Ok(entry) => {
                    let (tx, rx) = oneshot::channel();
                    self.waiters.insert(entry.index, tx);
                    let _ = reply.send(Ok(Proposal {
                        index: entry.index,
                        term: entry.term,
                        done: rx,
                    }));
                    self.send_all(self.node.broadcast_append_entries());
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Event::Status { reply } => {
                let _ = reply.send(self.node.status());
            }
            Event::Compact { reply } => {
                let _ = reply.send(self.node.compact());
            }
            Event::Read { read } => read(self.node.state_machine()),
            Event::Stop { reply } => {
                self.node.stop();
                self.resolve_waiters();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn reply<T>(&self, reply: Reply<T>, result: Result<T>) {
        if let Err(err) = &result {
            error!(id = %self.node.id, error = %err, "rpc handling failed");
        }
        let _ = reply.send(result);
    }

    fn on_timer(&mut self) {
        match self.node.state {
            NodeState::Leader => {
                self.send_all(self.node.broadcast_append_entries());
                self.deadline = Instant::now() + self.node.config.heartbeat();
            }
            NodeState::Follower | NodeState::Candidate => {
                match self.node.start_election() {
                    Ok(outbound) => self.send_all(outbound),
                    Err(err) => error!(id = %self.node.id, error = %err, "could not start election"),
                }
                self.reset_election_timer();
            }
            NodeState::Stopped => {}
        }
    }

    /// Re-arm the timer for a new role and hand out finished proposals
    fn after_event(&mut self, before: NodeState) {
        let now = self.node.state;
        if now != before {
            match now {
                NodeState::Leader => self.deadline = Instant::now() + self.node.config.heartbeat(),
                NodeState::Follower | NodeState::Candidate => self.reset_election_timer(),
                NodeState::Stopped => {}
            }
        }
        self.greet_new_peers();
        self.resolve_waiters();
    }

    /// Start replicating to members that joined during the last event
    fn greet_new_peers(&mut self) {
        if self.node.peers.len() == self.known_peers.len()
            && self.node.peers.keys().all(|name| self.known_peers.contains(name))
        {
            return;
        }
        let current: BTreeSet<NodeId> = self.node.peers.keys().cloned().collect();
        for name in current.difference(&self.known_peers) {
            debug!(id = %self.node.id, peer = %name, "replicating to new member");
            self.send_to(name);
        }
        self.known_peers = current;
    }

    fn reset_election_timer(&mut self) {
        self.deadline = Instant::now() + self.node.config.random_election_timeout();
    }

    fn resolve_waiters(&mut self) {
        for completion in self.node.take_completions() {
            if let Some(waiter) = self.waiters.remove(&completion.index) {
                let _ = waiter.send(completion.result);
            }
        }
    }

    fn send_to(&self, peer: &str) {
        if let Some(outbound) = self.node.create_append_entries(peer) {
            self.send(outbound);
        }
    }

    fn send_all(&self, outbound: Vec<Outbound>) {
        for message in outbound {
            self.send(message);
        }
    }

    /// Fire one rpc on its own task; the result comes back as an event
    fn send(&self, outbound: Outbound) {
        let Some(events) = self.sender.upgrade() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let limit = self.node.config.rpc_deadline();
        let term = outbound.term();
        let Outbound { to, message } = outbound;

        tokio::spawn(async move {
            let from = to.name.clone();
            let event = match message {
                RaftMessage::VoteRequest(request) => Event::VoteResult {
                    from,
                    result: bounded(limit, &to, transport.send_request_vote(&to, request)).await,
                },
                RaftMessage::AppendEntries(request) => Event::AppendResult {
                    from,
                    term,
                    result: bounded(limit, &to, transport.send_append_entries(&to, request)).await,
                },
                RaftMessage::InstallSnapshot(request) => Event::SnapshotResult {
                    from,
                    term,
                    result: bounded(limit, &to, transport.send_install_snapshot(&to, request))
                        .await,
                },
                RaftMessage::VoteResponse(_)
                | RaftMessage::AppendEntriesResponse(_)
                | RaftMessage::InstallSnapshotResponse(_) => return,
            };
            let _ = events.send(event).await;
        });
    }
}

async fn bounded<T>(
    limit: Duration,
    to: &PeerInfo,
    call: impl Future<Output = std::result::Result<T, TransportError>>,
) -> std::result::Result<T, TransportError> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            peer: to.name.clone(),
            millis: limit.as_millis() as u64,
        }),
    }
}
