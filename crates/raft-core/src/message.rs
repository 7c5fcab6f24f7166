//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried by raft-server transports
//! what: vote, append-entries and snapshot requests/responses, RaftMessage envelope

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::peer::PeerInfo;
use crate::storage::Snapshot;
use crate::NodeId;

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Response to AppendEntries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// on success, the last index the follower now shares with the leader
    pub match_index: u64,
    /// on mismatch, where the leader should retry from
    pub conflict_index: Option<u64>,
    /// the follower's commit index after handling the request
    pub commit_index: u64,
}

/// Ship a snapshot to a follower that is behind the leader's log base
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
}

/// Response to InstallSnapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
    /// the follower's last index after handling the snapshot
    pub last_index: u64,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(SnapshotRequest),
    InstallSnapshotResponse(SnapshotResponse),
}

impl RaftMessage {
    /// Term carried by the message
    pub fn term(&self) -> u64 {
        match self {
            Self::VoteRequest(m) => m.term,
            Self::VoteResponse(m) => m.term,
            Self::AppendEntries(m) => m.term,
            Self::AppendEntriesResponse(m) => m.term,
            Self::InstallSnapshot(m) => m.term,
            Self::InstallSnapshotResponse(m) => m.term,
        }
    }
}

/// A request the node wants delivered to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: PeerInfo,
    pub message: RaftMessage,
}

impl Outbound {
    pub fn new(to: PeerInfo, message: RaftMessage) -> Self {
        Self { to, message }
    }

    /// Term the request was sent in, used to discard late responses
    pub fn term(&self) -> u64 {
        self.message.term()
    }
}
