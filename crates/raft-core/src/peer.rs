//! # peer
//!
//! why: track what the leader knows about each remote member's log
//! relations: owned by node.rs, carried in snapshots and membership commands
//! what: PeerInfo identity, Peer replication progress, backtracking on mismatch

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Identity of a cluster member: its name and an opaque transport address
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: NodeId,
    pub address: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A remote member and its replication progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub info: PeerInfo,
    /// next log index to send this peer
    pub next_index: u64,
    /// highest index known to be replicated on this peer
    pub match_index: u64,
    /// index of the applied entry that removed this peer; it still gets
    /// entries until it has seen that entry commit, but no longer votes
    pub removed_at: Option<u64>,
}

impl Peer {
    pub fn new(info: PeerInfo, next_index: u64) -> Self {
        Self {
            info,
            next_index: next_index.max(1),
            match_index: 0,
            removed_at: None,
        }
    }

    /// Counts towards quorums and elections
    pub fn is_voter(&self) -> bool {
        self.removed_at.is_none()
    }

    /// The peer reported a commit index covering its own removal
    pub fn saw_removal(&self, commit_index: u64) -> bool {
        self.removed_at.is_some_and(|at| commit_index >= at)
    }

    /// Leader-side reset after winning an election
    pub fn reset(&mut self, next_index: u64) {
        self.next_index = next_index.max(1);
        self.match_index = 0;
    }

    /// The peer acknowledged everything up to `match_index`
    ///
    /// returns true when progress moved; late acknowledgements never regress it.
    pub fn record_success(&mut self, match_index: u64) -> bool {
        if match_index <= self.match_index {
            self.next_index = self.next_index.max(self.match_index + 1);
            return false;
        }
        self.match_index = match_index;
        self.next_index = match_index + 1;
        true
    }

    /// The peer rejected our previous entry; step `next_index` back
    ///
    /// a conflict hint lets us skip a whole run of mismatching entries,
    /// otherwise we walk back one entry at a time.
    pub fn record_mismatch(&mut self, conflict_index: Option<u64>) {
        let fallback = self.next_index.saturating_sub(1);
        let next = match conflict_index {
            Some(hint) if hint > 0 => hint.min(fallback),
            _ => fallback,
        };
        // never below what the peer already confirmed
        self.next_index = next.max(self.match_index + 1).max(1);
    }
}
