//! # raft-core
//!
//! why: implement the raft consensus algorithm as a synchronous, io-free core
//! relations: raft-storage persists it through the Storage trait, raft-server drives it
//! what: replicated log, node roles, rpc messages, membership, command registry

pub mod command;
pub mod config;
pub mod error;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod peer;
pub mod storage;

/// Stable name identifying a cluster member
pub type NodeId = String;

pub use command::{Command, CommandRegistry, StateMachine};
pub use config::RaftConfig;
pub use error::{ApplyError, RaftError, Result};
pub use log::{AppendOutcome, CommandRecord, CommitReport, Log, LogEntry};
pub use membership::{MembershipChange, JOIN_COMMAND, LEAVE_COMMAND};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Outbound, RaftMessage, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
pub use node::{Completion, NodeState, NodeStatus, PeerStatus, RaftNode};
pub use peer::{Peer, PeerInfo};
pub use storage::{HardState, MemoryStorage, PersistentState, Snapshot, Storage};
