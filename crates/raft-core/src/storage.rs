//! # storage
//!
//! why: keep the log's durability contract independent of where bytes live
//! relations: owned by log.rs; implemented on disk by raft-storage, in memory here
//! what: Storage trait, HardState, Snapshot, PersistentState, MemoryStorage

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::LogEntry;
use crate::peer::PeerInfo;
use crate::NodeId;

/// Term and vote, persisted before any response that depends on them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Compact marker replacing every entry up to `last_index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    /// cluster membership as of `last_index`, self included
    pub peers: Vec<PeerInfo>,
    /// state machine image
    pub state: Vec<u8>,
}

/// Everything a node needs to resume after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    /// entries after the snapshot base, contiguous
    pub entries: Vec<LogEntry>,
}

/// trait for durable storage of raft state
///
/// this abstraction allows the same log code to work with:
/// - an append-only record file (raft-storage)
/// - memory (testing, ephemeral nodes)
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> Result<()>;

    /// append entries to the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// drop every entry with index >= from_index (conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> Result<()>;

    /// replace the log prefix with a snapshot, keeping `retained` entries after it
    fn save_snapshot(&mut self, snapshot: &Snapshot, retained: &[LogEntry]) -> Result<()>;

    /// load everything persisted so far (crash recovery)
    fn load(&mut self) -> Result<PersistentState>;

    /// clear all persisted state
    fn clear(&mut self) -> Result<()>;
}

/// in-memory storage
///
/// clones share the same state, so a test can hand one clone to a node,
/// drop the node and reopen from another clone to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<PersistentState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PersistentState> {
        // a panic while holding the lock cannot leave the state half written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of persisted entries, for assertions
    pub fn entry_count(&self) -> usize {
        self.state().entries.len()
    }
}

impl Storage for MemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> Result<()> {
        self.state().hard_state = HardState {
            term,
            voted_for: voted_for.map(str::to_owned),
        };
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.state().entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        self.state().entries.retain(|e| e.index < from_index);
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot, retained: &[LogEntry]) -> Result<()> {
        let mut state = self.state();
        state.snapshot = Some(snapshot.clone());
        state.entries = retained.to_vec();
        Ok(())
    }

    fn load(&mut self) -> Result<PersistentState> {
        Ok(self.state().clone())
    }

    fn clear(&mut self) -> Result<()> {
        *self.state() = PersistentState::default();
        Ok(())
    }
}
