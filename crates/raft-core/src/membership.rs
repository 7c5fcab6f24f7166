//! # membership
//!
//! why: change the cluster's member set through the log so every node agrees on it
//! relations: decoded by command.rs like any command; node.rs applies it to its peers
//! what: MembershipChange join/leave command and its reserved names

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{ApplyError, RaftError, Result};
use crate::log::CommandRecord;
use crate::peer::PeerInfo;
use crate::NodeId;

/// Reserved command name for adding a member
pub const JOIN_COMMAND: &str = "raft:join";
/// Reserved command name for removing a member
pub const LEAVE_COMMAND: &str = "raft:leave";

/// A replicated change to the member set
///
/// takes effect on every node when the entry is applied, i.e. once it has
/// committed under the member set that existed before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MembershipChange {
    Join(PeerInfo),
    Leave { name: NodeId },
}

impl MembershipChange {
    pub fn join(info: PeerInfo) -> Self {
        Self::Join(info)
    }

    pub fn leave(name: impl Into<NodeId>) -> Self {
        Self::Leave { name: name.into() }
    }

    /// Whether `name` is one of the reserved membership command names
    pub fn is_membership(name: &str) -> bool {
        name == JOIN_COMMAND || name == LEAVE_COMMAND
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Join(_) => JOIN_COMMAND,
            Self::Leave { .. } => LEAVE_COMMAND,
        }
    }

    /// The member being added or removed
    pub fn peer_name(&self) -> &str {
        match self {
            Self::Join(info) => &info.name,
            Self::Leave { name } => name,
        }
    }

    pub fn to_record(&self) -> Result<CommandRecord> {
        let payload =
            serde_json::to_vec(self).map_err(|e| RaftError::codec(self.command_name(), e))?;
        Ok(CommandRecord::new(self.command_name(), payload))
    }

    /// Decode a record if it carries a membership change
    pub fn from_record(record: &CommandRecord) -> Result<Option<Self>> {
        if !Self::is_membership(&record.name) {
            return Ok(None);
        }
        serde_json::from_slice(&record.payload)
            .map(Some)
            .map_err(|e| RaftError::codec(record.name.clone(), e))
    }
}

impl<S> Command<S> for MembershipChange {
    fn name(&self) -> &str {
        self.command_name()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::codec(self.command_name(), e))
    }

    // the member set belongs to the node, not to the application
    fn apply(&self, _state: &mut S) -> std::result::Result<(), ApplyError> {
        Ok(())
    }
}
