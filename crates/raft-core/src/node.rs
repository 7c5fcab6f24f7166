//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses log.rs for entries, peer.rs for progress, message.rs for rpc types,
//!            command.rs/membership.rs to apply committed entries; driven by raft-server
//! what: NodeState, RaftNode elections, replication, commit rule, membership, completions
//!
//! the node is synchronous and never touches the network or a clock. callers
//! feed it rpcs and timer expiries and send whatever it hands back.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{Command, CommandRegistry, StateMachine};
use crate::config::RaftConfig;
use crate::error::{ApplyError, RaftError, Result};
use crate::log::{CommandRecord, CommitReport, Log, LogEntry};
use crate::membership::MembershipChange;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Outbound, RaftMessage, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::peer::{Peer, PeerInfo};
use crate::storage::{Snapshot, Storage};
use crate::NodeId;

/// The possible roles of a Raft node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
    /// Terminal state - no timers, no proposals, no votes
    Stopped,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// Resolution of an entry this node proposed
#[derive(Debug)]
pub struct Completion {
    pub index: u64,
    pub term: u64,
    /// Ok once applied; Apply if the state machine rejected it; CommandFailed if lost
    pub result: Result<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub name: NodeId,
    pub address: String,
    pub next_index: u64,
    pub match_index: u64,
}

/// Point-in-time view of a node for administrative queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub peers: Vec<PeerStatus>,
    pub apply_failures: u64,
}

/// A single Raft node in the cluster
pub struct RaftNode<S: StateMachine> {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Transport address other members use to reach us
    pub address: String,
    pub state: NodeState,
    pub current_term: u64,
    /// Node that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    pub log: Log,
    /// Remote members, self excluded
    pub peers: BTreeMap<NodeId, Peer>,
    /// Members that granted us a vote in the current election, self included
    pub votes_received: BTreeSet<NodeId>,
    pub leader_id: Option<NodeId>,
    pub config: RaftConfig,
    state_machine: S,
    registry: Arc<CommandRegistry<S>>,
    /// index -> term of entries proposed here and not yet resolved
    proposals: BTreeMap<u64, u64>,
    completions: Vec<Completion>,
    apply_failures: u64,
}

impl<S: StateMachine> RaftNode<S> {
    /// Open a node over `storage`, restoring term, vote, log and snapshot
    pub fn open(
        id: impl Into<NodeId>,
        address: impl Into<String>,
        storage: Box<dyn Storage>,
        state_machine: S,
        registry: Arc<CommandRegistry<S>>,
        config: RaftConfig,
    ) -> Result<Self> {
        let log = Log::open(storage)?;
        let mut node = Self::from_parts(id.into(), address.into(), log, state_machine, registry, config);
        if let Some(snapshot) = node.log.snapshot().cloned() {
            node.restore_snapshot(&snapshot)?;
        }
        info!(id = %node.id, term = node.current_term, last_index = node.log.last_index(), "node opened");
        Ok(node)
    }

    /// A node with an empty in-memory log, default config and the built-in registry
    pub fn in_memory(id: impl Into<NodeId>, state_machine: S) -> Self {
        let id = id.into();
        let address = format!("mem://{id}");
        Self::from_parts(
            id,
            address,
            Log::in_memory(),
            state_machine,
            Arc::new(CommandRegistry::new()),
            RaftConfig::default(),
        )
    }

    fn from_parts(
        id: NodeId,
        address: String,
        log: Log,
        state_machine: S,
        registry: Arc<CommandRegistry<S>>,
        config: RaftConfig,
    ) -> Self {
        let hard_state = log.hard_state().clone();
        Self {
            id,
            address,
            state: NodeState::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            peers: BTreeMap::new(),
            votes_received: BTreeSet::new(),
            leader_id: None,
            config,
            state_machine,
            registry,
            proposals: BTreeMap::new(),
            completions: Vec::new(),
            apply_failures: 0,
        }
    }

    pub fn with_config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<CommandRegistry<S>>) -> Self {
        self.registry = registry;
        self
    }

    /// Register a static member before the node starts
    ///
    /// this is how a fresh cluster forms; later changes go through the log.
    pub fn bootstrap_peer(&mut self, info: PeerInfo) {
        if info.name == self.id || self.peers.contains_key(&info.name) {
            return;
        }
        let next = self.log.last_index() + 1;
        self.peers.insert(info.name.clone(), Peer::new(info, next));
    }

    // -- queries --

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn state_machine_mut(&mut self) -> &mut S {
        &mut self.state_machine
    }

    pub fn registry(&self) -> &Arc<CommandRegistry<S>> {
        &self.registry
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn is_stopped(&self) -> bool {
        self.state == NodeState::Stopped
    }

    pub fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// Remote peers that still count as members
    pub fn voters(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.values().filter(|p| p.is_voter())
    }

    /// Every member including this node
    pub fn members(&self) -> Vec<PeerInfo> {
        let mut members: Vec<PeerInfo> = self.voters().map(|p| p.info.clone()).collect();
        members.push(PeerInfo::new(self.id.clone(), self.address.clone()));
        members.sort();
        members
    }

    /// Votes or acknowledgements needed for a strict majority of members
    pub fn quorum_size(&self) -> usize {
        (self.voters().count() + 1) / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// Index of an uncommitted membership change, if one is in flight
    pub fn pending_membership_index(&self) -> Option<u64> {
        let commit_index = self.log.commit_index();
        self.log
            .entries()
            .iter()
            .filter(|e| e.index > commit_index)
            .find(|e| MembershipChange::is_membership(&e.command.name))
            .map(|e| e.index)
    }

    /// Whether the leader still has entries to ship to `peer`
    pub fn needs_replication(&self, peer: &str) -> bool {
        self.is_leader()
            && self
                .peers
                .get(peer)
                .is_some_and(|p| p.next_index <= self.log.last_index())
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            state: self.state,
            term: self.current_term,
            leader_id: self.leader_id.clone(),
            commit_index: self.log.commit_index(),
            last_applied: self.log.last_applied(),
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
            peers: self
                .voters()
                .map(|p| PeerStatus {
                    name: p.info.name.clone(),
                    address: p.info.address.clone(),
                    next_index: p.next_index,
                    match_index: p.match_index,
                })
                .collect(),
            apply_failures: self.apply_failures,
        }
    }

    /// Drain resolutions of entries proposed on this node
    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    // -- role transitions --

    fn persist_hard_state(&mut self) -> Result<()> {
        self.log
            .save_hard_state(self.current_term, self.voted_for.as_deref())
    }

    /// Step down, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: u64) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_hard_state()?;
        }
        if self.state != NodeState::Follower {
            info!(id = %self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        // removed peers are only tracked while leading
        self.peers.retain(|_, p| p.is_voter());
        Ok(())
    }

    fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();
        let next = self.log.last_index() + 1;
        for peer in self.peers.values_mut() {
            peer.reset(next);
        }
        info!(id = %self.id, term = self.current_term, last_index = next - 1, "became leader");
    }

    /// Election timeout: start a new term and ask every peer for a vote
    ///
    /// a single-member cluster wins immediately.
    pub fn start_election(&mut self) -> Result<Vec<Outbound>> {
        if matches!(self.state, NodeState::Leader | NodeState::Stopped) {
            return Ok(Vec::new());
        }

        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());
        self.persist_hard_state()?;
        info!(id = %self.id, term = self.current_term, "starting election");

        if self.has_quorum() {
            self.become_leader();
            return Ok(self.broadcast_append_entries());
        }

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        Ok(self
            .voters()
            .map(|p| Outbound::new(p.info.clone(), RaftMessage::VoteRequest(request.clone())))
            .collect())
    }

    /// Explicit shutdown; pending proposals fail
    pub fn stop(&mut self) {
        if self.is_stopped() {
            return;
        }
        self.state = NodeState::Stopped;
        self.votes_received.clear();
        self.leader_id = None;
        self.fail_proposals_from(0, "node stopped");
        info!(id = %self.id, term = self.current_term, "node stopped");
    }

    // -- vote rpc --

    /// Handle RequestVote; the bool says whether to reset the election timer
    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> Result<(VoteResponse, bool)> {
        if self.is_stopped() || request.term < self.current_term {
            debug!(id = %self.id, candidate = %request.candidate_id, term = request.term, "rejecting stale vote request");
            return Ok((self.vote_response(false), false));
        }
        if request.term > self.current_term {
            self.become_follower(request.term)?;
        }

        let free_to_vote = self
            .voted_for
            .as_deref()
            .map_or(true, |voted| voted == request.candidate_id);
        let up_to_date = self
            .log
            .is_up_to_date(request.last_log_index, request.last_log_term);

        if free_to_vote && up_to_date {
            self.voted_for = Some(request.candidate_id.clone());
            self.persist_hard_state()?;
            debug!(id = %self.id, candidate = %request.candidate_id, term = self.current_term, "granted vote");
            return Ok((self.vote_response(true), true));
        }
        Ok((self.vote_response(false), false))
    }

    fn vote_response(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote; returns true when it made us leader
    pub fn handle_vote_response(&mut self, from: &str, response: &VoteResponse) -> Result<bool> {
        if response.term > self.current_term {
            self.become_follower(response.term)?;
            return Ok(false);
        }
        if self.state != NodeState::Candidate || response.term != self.current_term {
            return Ok(false);
        }
        if response.vote_granted && self.peers.get(from).is_some_and(Peer::is_voter) {
            self.votes_received.insert(from.to_string());
        }
        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    // -- proposals --

    /// Append a command to the leader's log
    ///
    /// returns once the entry is persisted locally; commitment is reported
    /// later through `take_completions`.
    pub fn propose(&mut self, record: CommandRecord) -> Result<LogEntry> {
        match self.state {
            NodeState::Leader => {}
            NodeState::Stopped => return Err(RaftError::Stopped),
            _ => {
                return Err(RaftError::NotLeader {
                    leader: self.leader_id.clone(),
                })
            }
        }
        if MembershipChange::is_membership(&record.name) {
            if let Some(index) = self.pending_membership_index() {
                return Err(RaftError::MembershipChangePending { index });
            }
        }

        let entry = self.log.append(self.current_term, record)?;
        self.proposals.insert(entry.index, entry.term);
        debug!(id = %self.id, index = entry.index, name = %entry.command.name, "proposed entry");

        if self.quorum_size() == 1 {
            self.advance_commit()?;
        }
        Ok(entry)
    }

    pub fn propose_command(&mut self, command: &dyn Command<S>) -> Result<LogEntry> {
        self.propose(command.to_record()?)
    }

    pub fn propose_add_peer(&mut self, info: PeerInfo) -> Result<LogEntry> {
        self.propose(MembershipChange::join(info).to_record()?)
    }

    pub fn propose_remove_peer(&mut self, name: &str) -> Result<LogEntry> {
        self.propose(MembershipChange::leave(name).to_record()?)
    }

    // -- replication, leader side --

    /// Build the next request for `peer`: entries from its next_index, or a
    /// snapshot when those entries were compacted away
    pub fn create_append_entries(&self, peer: &str) -> Option<Outbound> {
        if !self.is_leader() {
            return None;
        }
        let peer = self.peers.get(peer)?;

        if peer.next_index <= self.log.snapshot_index() {
            let snapshot = self.log.snapshot()?.clone();
            return Some(Outbound::new(
                peer.info.clone(),
                RaftMessage::InstallSnapshot(SnapshotRequest {
                    term: self.current_term,
                    leader_id: self.id.clone(),
                    snapshot,
                }),
            ));
        }

        let prev_log_index = peer.next_index - 1;
        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self
                .log
                .entries_from(peer.next_index, self.config.max_entries_per_message),
            leader_commit: self.log.commit_index(),
        };
        Some(Outbound::new(peer.info.clone(), RaftMessage::AppendEntries(request)))
    }

    /// AppendEntries for every peer; doubles as the heartbeat
    pub fn broadcast_append_entries(&self) -> Vec<Outbound> {
        self.peers
            .keys()
            .filter_map(|name| self.create_append_entries(name))
            .collect()
    }

    /// Record a follower's answer; returns true when the commit index moved
    ///
    /// `sent_term` is the term the request went out in; answers to requests
    /// from an older term are dropped.
    pub fn handle_append_entries_response(
        &mut self,
        from: &str,
        sent_term: u64,
        response: &AppendEntriesResponse,
    ) -> Result<bool> {
        if response.term > self.current_term {
            self.become_follower(response.term)?;
            return Ok(false);
        }
        if !self.is_leader() || sent_term != self.current_term {
            debug!(id = %self.id, from, sent_term, "discarding stale append response");
            return Ok(false);
        }
        let Some(peer) = self.peers.get_mut(from) else {
            return Ok(false);
        };
        if peer.saw_removal(response.commit_index) {
            self.forget_removed_peer(from);
            return Ok(false);
        }

        if response.success {
            peer.record_success(response.match_index);
            return self.advance_commit();
        }

        peer.record_mismatch(response.conflict_index);
        debug!(id = %self.id, peer = from, next_index = peer.next_index, "backtracking after mismatch");
        Ok(false)
    }

    pub fn handle_install_snapshot_response(
        &mut self,
        from: &str,
        sent_term: u64,
        response: &SnapshotResponse,
    ) -> Result<bool> {
        if response.term > self.current_term {
            self.become_follower(response.term)?;
            return Ok(false);
        }
        if !self.is_leader() || sent_term != self.current_term {
            return Ok(false);
        }
        let Some(peer) = self.peers.get_mut(from) else {
            return Ok(false);
        };
        if peer.saw_removal(response.last_index) {
            self.forget_removed_peer(from);
            return Ok(false);
        }
        peer.record_success(response.last_index);
        self.advance_commit()
    }

    /// Commit the highest index a majority holds, if it is from our term
    ///
    /// older entries are never counted directly; they commit along with
    /// the first entry of the current term above them.
    pub fn advance_commit(&mut self) -> Result<bool> {
        if !self.is_leader() {
            return Ok(false);
        }
        let mut matched: Vec<u64> = self.voters().map(|p| p.match_index).collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum_size() - 1];
        if candidate <= self.log.commit_index() {
            return Ok(false);
        }
        if self.log.term_at(candidate) != Some(self.current_term) {
            debug!(id = %self.id, candidate, "majority index is from an older term, waiting");
            return Ok(false);
        }
        self.commit_to(candidate)?;
        Ok(true)
    }

    // -- replication, follower side --

    /// Handle AppendEntries; the bool says whether to reset the election timer
    pub fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<(AppendEntriesResponse, bool)> {
        if self.is_stopped() || request.term < self.current_term {
            debug!(id = %self.id, leader = %request.leader_id, term = request.term, "rejecting stale append");
            return Ok((self.append_response(false, 0, None), false));
        }
        if request.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(request.term)?;
        }
        let AppendEntriesRequest {
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
            ..
        } = request;
        self.leader_id = Some(leader_id);

        match self.log.append_entries(prev_log_index, prev_log_term, entries) {
            Ok(outcome) => {
                if let Some(from) = outcome.truncated_from {
                    self.fail_proposals_from(from, "entry was replaced by a newer leader");
                }
                self.commit_to(leader_commit.min(outcome.last_new_index))?;
                Ok((self.append_response(true, outcome.last_new_index, None), true))
            }
            Err(RaftError::LogMismatch { conflict_index, .. }) => {
                debug!(id = %self.id, prev_log_index, prev_log_term, conflict_index, "log mismatch");
                Ok((self.append_response(false, 0, Some(conflict_index)), true))
            }
            Err(err) => Err(err),
        }
    }

    fn append_response(
        &self,
        success: bool,
        match_index: u64,
        conflict_index: Option<u64>,
    ) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
            conflict_index,
            commit_index: self.log.commit_index(),
        }
    }

    /// Handle InstallSnapshot; the bool says whether to reset the election timer
    pub fn handle_install_snapshot(
        &mut self,
        request: SnapshotRequest,
    ) -> Result<(SnapshotResponse, bool)> {
        if self.is_stopped() || request.term < self.current_term {
            return Ok((self.snapshot_response(), false));
        }
        if request.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(request.term)?;
        }
        self.leader_id = Some(request.leader_id);

        let snapshot = request.snapshot;
        let agrees = self.log.term_at(snapshot.last_index) == Some(snapshot.last_term);
        // decide the fate of our proposals before the entries disappear
        let covered: Vec<(u64, u64, bool)> = self
            .proposals
            .range(..=snapshot.last_index)
            .map(|(&index, &term)| (index, term, agrees && self.log.term_at(index) == Some(term)))
            .collect();

        if self.log.install_snapshot(snapshot.clone())? {
            self.restore_snapshot(&snapshot)?;
            for (index, term, kept) in covered {
                self.proposals.remove(&index);
                let result = if kept {
                    Ok(())
                } else {
                    Err(RaftError::CommandFailed {
                        index,
                        term,
                        reason: "superseded by the leader's snapshot".to_string(),
                    })
                };
                self.completions.push(Completion { index, term, result });
            }
            if !agrees {
                self.fail_proposals_from(snapshot.last_index + 1, "log discarded for snapshot");
            }
        }
        Ok((self.snapshot_response(), true))
    }

    fn snapshot_response(&self) -> SnapshotResponse {
        SnapshotResponse {
            term: self.current_term,
            last_index: self.log.commit_index(),
        }
    }

    fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.state_machine
            .restore(&snapshot.state)
            .map_err(|source| RaftError::Apply {
                index: snapshot.last_index,
                source,
            })?;
        let next = self.log.last_index() + 1;
        self.peers = snapshot
            .peers
            .iter()
            .filter(|p| p.name != self.id)
            .map(|p| (p.name.clone(), Peer::new(p.clone(), next)))
            .collect();
        Ok(())
    }

    // -- commit and apply --

    fn commit_to(&mut self, index: u64) -> Result<()> {
        let mut membership = Vec::new();
        let report = {
            let Self {
                log,
                state_machine,
                registry,
                ..
            } = self;
            log.commit_to(index, |entry| {
                apply_entry(state_machine, &**registry, entry, &mut membership)
            })
        };
        if report.is_empty() {
            return Ok(());
        }

        self.resolve_commits(&report);
        for (index, change) in membership {
            self.apply_membership(index, change);
        }
        self.maybe_compact()?;
        Ok(())
    }

    fn apply_membership(&mut self, index: u64, change: MembershipChange) {
        match change {
            MembershipChange::Join(info) => {
                if info.name == self.id {
                    return;
                }
                info!(id = %self.id, index, peer = %info.name, "member joined");
                match self.peers.get_mut(&info.name) {
                    Some(peer) => {
                        peer.info = info;
                        peer.removed_at = None;
                    }
                    None => {
                        // a new member may have nothing: start from our oldest entry
                        let next = self.log.first_index();
                        self.peers.insert(info.name.clone(), Peer::new(info, next));
                    }
                }
            }
            MembershipChange::Leave { name } => {
                if name == self.id {
                    info!(id = %self.id, index, "removed from the cluster");
                    self.stop();
                    return;
                }
                info!(id = %self.id, index, peer = %name, "member left");
                self.votes_received.remove(&name);
                match self.peers.get_mut(&name) {
                    // keep feeding it until it learns the removal committed
                    Some(peer) if self.state == NodeState::Leader => peer.removed_at = Some(index),
                    _ => {
                        self.peers.remove(&name);
                    }
                }
            }
        }
    }

    fn forget_removed_peer(&mut self, name: &str) {
        if self.peers.remove(name).is_some() {
            info!(id = %self.id, peer = name, "removed member saw its removal commit");
        }
    }

    fn resolve_commits(&mut self, report: &CommitReport) {
        self.apply_failures += report.failures.len() as u64;
        for &index in &report.applied {
            let Some(term) = self.proposals.remove(&index) else {
                continue;
            };
            let result = if self.log.term_at(index) != Some(term) {
                Err(RaftError::CommandFailed {
                    index,
                    term,
                    reason: "a different entry committed at this index".to_string(),
                })
            } else {
                match report.failure_for(index) {
                    Some(err) => Err(RaftError::Apply {
                        index,
                        source: err.clone(),
                    }),
                    None => Ok(()),
                }
            };
            self.completions.push(Completion { index, term, result });
        }
    }

    fn fail_proposals_from(&mut self, from: u64, reason: &str) {
        let lost = self.proposals.split_off(&from);
        for (index, term) in lost {
            warn!(id = %self.id, index, term, reason, "proposal lost");
            self.completions.push(Completion {
                index,
                term,
                result: Err(RaftError::CommandFailed {
                    index,
                    term,
                    reason: reason.to_string(),
                }),
            });
        }
    }

    // -- compaction --

    /// Snapshot the state machine at last_applied and drop the covered entries
    pub fn compact(&mut self) -> Result<bool> {
        let upto = self.log.last_applied();
        let state = self
            .state_machine
            .snapshot()
            .map_err(|source| RaftError::Apply { index: upto, source })?;
        let members = self.members();
        self.log.compact(upto, state, members)
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let Some(threshold) = self.config.compaction_threshold else {
            return Ok(());
        };
        if self.log.last_applied() - self.log.snapshot_index() > threshold {
            self.compact()?;
        }
        Ok(())
    }
}

fn apply_entry<S: StateMachine>(
    state_machine: &mut S,
    registry: &CommandRegistry<S>,
    entry: &LogEntry,
    membership: &mut Vec<(u64, MembershipChange)>,
) -> std::result::Result<(), ApplyError> {
    match MembershipChange::from_record(&entry.command) {
        Ok(Some(change)) => {
            membership.push((entry.index, change));
            return Ok(());
        }
        Ok(None) => {}
        Err(err) => return Err(ApplyError::new(err.to_string())),
    }
    let command = registry
        .decode_record(&entry.command)
        .map_err(|err| ApplyError::new(err.to_string()))?;
    state_machine.apply(entry.index, &*command)
}

impl<S: StateMachine> fmt::Debug for RaftNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("leader_id", &self.leader_id)
            .field("log", &self.log)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}
