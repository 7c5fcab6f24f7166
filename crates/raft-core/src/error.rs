//! # error
//!
//! why: give every failure in the consensus core one typed home
//! relations: returned by log.rs, command.rs, node.rs; wrapped by raft-storage and raft-server
//! what: RaftError taxonomy, ApplyError for state machine failures, Result alias

use thiserror::Error;

use crate::NodeId;

/// Convenience alias used across the workspace
pub type Result<T, E = RaftError> = std::result::Result<T, E>;

/// Failure reported by a state machine while applying a committed command
///
/// apply errors never halt the log; they are handed back to whoever waits
/// on the entry and logged otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ApplyError(pub String);

impl ApplyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Every error the consensus core can produce
#[derive(Debug, Error)]
pub enum RaftError {
    /// A term older than the persisted one; terms never move backwards
    #[error("stale term {received}, current term is {current}")]
    StaleTerm { current: u64, received: u64 },

    /// The entry preceding an append did not match the local log
    #[error("log mismatch at index {index}: expected term {expected_term}, found {found_term:?}")]
    LogMismatch {
        index: u64,
        expected_term: u64,
        found_term: Option<u64>,
        /// where the sender should retry from
        conflict_index: u64,
    },

    /// A replication request tried to rewrite an entry that is already committed
    #[error("entry {index} is committed and cannot be replaced")]
    CommittedConflict { index: u64 },

    /// A persisted record could not be decoded
    #[error("corrupt log record {record}: {reason}")]
    CorruptLog { record: usize, reason: String },

    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error for '{name}': {source}")]
    Codec {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown command '{name}'")]
    UnknownCommand { name: String },

    #[error("command '{name}' is already registered")]
    DuplicateCommand { name: String },

    /// The awaited entry was lost before it could commit
    #[error("command at index {index} (term {term}) failed: {reason}")]
    CommandFailed { index: u64, term: u64, reason: String },

    /// The entry committed but the state machine rejected it
    #[error("apply of entry {index} failed: {source}")]
    Apply {
        index: u64,
        #[source]
        source: ApplyError,
    },

    #[error("not the leader, current leader: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("membership change at index {index} has not committed yet")]
    MembershipChangePending { index: u64 },

    #[error("cannot compact to {index}: {reason}")]
    Compaction { index: u64, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node is stopped")]
    Stopped,
}

impl RaftError {
    pub fn codec(name: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Codec {
            name: name.into(),
            source,
        }
    }

    /// True for the errors a proposer can fix by retrying on another node
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::CommandFailed { .. } | Self::MembershipChangePending { .. }
        )
    }
}
