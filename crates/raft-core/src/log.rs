//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted through storage.rs
//! what: LogEntry, CommandRecord, log matching, commit index, apply ordering, compaction

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ApplyError, RaftError, Result};
use crate::peer::PeerInfo;
use crate::storage::{HardState, MemoryStorage, Snapshot, Storage};

/// Opaque named payload carried by a log entry
///
/// the name selects the decoder in the command registry; the payload is
/// whatever that command's encoder produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub name: String,
    pub payload: Vec<u8>,
}

impl CommandRecord {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: CommandRecord,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: CommandRecord) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// Result of accepting entries from a leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// index of the last entry carried by the request (prev_log_index + len)
    pub last_new_index: u64,
    /// first index removed because it conflicted, if any
    pub truncated_from: Option<u64>,
}

/// What a commit advance applied
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommitReport {
    /// every index handed to the apply function, in order
    pub applied: Vec<u64>,
    /// the subset whose apply failed
    pub failures: Vec<(u64, ApplyError)>,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn failure_for(&self, index: u64) -> Option<&ApplyError> {
        self.failures
            .iter()
            .find(|(failed, _)| *failed == index)
            .map(|(_, err)| err)
    }
}

/// The replicated log with its persistence and commit state
pub struct Log {
    storage: Box<dyn Storage>,
    /// entries after the snapshot base
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    hard_state: HardState,
    commit_index: u64,
    last_applied: u64,
}

impl Log {
    /// Load the snapshot, hard state and entries held by `storage`
    pub fn open(mut storage: Box<dyn Storage>) -> Result<Self> {
        let state = storage.load()?;
        let base = state.snapshot.as_ref().map_or(0, |s| s.last_index);

        for (offset, entry) in state.entries.iter().enumerate() {
            let expected = base + 1 + offset as u64;
            if entry.index != expected {
                return Err(RaftError::CorruptLog {
                    record: offset,
                    reason: format!("entry index {} where {} was expected", entry.index, expected),
                });
            }
        }

        info!(
            term = state.hard_state.term,
            snapshot_index = base,
            entries = state.entries.len(),
            "opened log"
        );

        Ok(Self {
            storage,
            entries: state.entries,
            snapshot: state.snapshot,
            hard_state: state.hard_state,
            commit_index: base,
            last_applied: base,
        })
    }

    /// An empty log backed by memory
    pub fn in_memory() -> Self {
        Self {
            storage: Box::new(MemoryStorage::new()),
            entries: Vec::new(),
            snapshot: None,
            hard_state: HardState::default(),
            commit_index: 0,
            last_applied: 0,
        }
    }

    // -- queries --

    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.last_index)
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.last_term)
    }

    /// Lowest index still held as an entry
    pub fn first_index(&self) -> u64 {
        self.snapshot_index() + 1
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map_or_else(|| self.snapshot_index(), |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map_or_else(|| self.snapshot_term(), |e| e.term)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Entries held after the snapshot base
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, index: u64) -> Option<usize> {
        let base = self.snapshot_index();
        if index <= base {
            return None;
        }
        let pos = (index - base - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    /// Term of the entry at `index`; index 0 and the snapshot base are known too
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index() {
            return Some(self.snapshot_term());
        }
        self.entry(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `index`
    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        let start = index.max(self.first_index());
        match self.position(start) {
            Some(pos) => self.entries[pos..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Whether a log ending at (last_index, last_term) is at least as up to date as ours
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }

    // -- mutation --

    /// Persist term and vote; a no-op when nothing changed
    pub fn save_hard_state(&mut self, term: u64, voted_for: Option<&str>) -> Result<()> {
        if term < self.hard_state.term {
            return Err(RaftError::StaleTerm {
                current: self.hard_state.term,
                received: term,
            });
        }
        if self.hard_state.term == term && self.hard_state.voted_for.as_deref() == voted_for {
            return Ok(());
        }
        self.storage.save_term_and_vote(term, voted_for)?;
        self.hard_state = HardState {
            term,
            voted_for: voted_for.map(str::to_owned),
        };
        Ok(())
    }

    /// Append a leader's own proposal at the tail
    pub fn append(&mut self, term: u64, command: CommandRecord) -> Result<LogEntry> {
        let entry = LogEntry::new(term, self.last_index() + 1, command);
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Accept entries from a leader, enforcing log matching
    ///
    /// entries must be contiguous from `prev_index + 1`. entries already held
    /// with the same term are skipped; the first conflicting one truncates the
    /// local suffix before the rest is appended.
    pub fn append_entries(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
    ) -> Result<AppendOutcome> {
        let base = self.snapshot_index();
        // everything at or below the snapshot base is committed and therefore matches
        if prev_index >= base {
            match self.term_at(prev_index) {
                Some(term) if term == prev_term => {}
                found => return Err(self.mismatch(prev_index, prev_term, found)),
            }
        }

        let last_new_index = prev_index + entries.len() as u64;
        let mut truncated_from = None;
        let mut pending: Vec<LogEntry> = Vec::new();

        for entry in entries {
            if entry.index <= base {
                continue;
            }
            if !pending.is_empty() {
                pending.push(entry);
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(RaftError::CommittedConflict { index: entry.index });
                    }
                    self.truncate_from(entry.index)?;
                    truncated_from = Some(entry.index);
                    pending.push(entry);
                }
                None => pending.push(entry),
            }
        }

        if !pending.is_empty() {
            self.storage.append_entries(&pending)?;
            debug!(
                from = pending[0].index,
                count = pending.len(),
                "appended replicated entries"
            );
            self.entries.extend(pending);
        }

        Ok(AppendOutcome {
            last_new_index,
            truncated_from,
        })
    }

    fn mismatch(&self, prev_index: u64, prev_term: u64, found: Option<u64>) -> RaftError {
        let conflict_index = match found {
            None => self.last_index() + 1,
            Some(term) => {
                // first index of the conflicting term, so the leader skips the whole run
                let mut index = prev_index;
                while index > self.first_index() && self.term_at(index - 1) == Some(term) {
                    index -= 1;
                }
                index
            }
        };
        RaftError::LogMismatch {
            index: prev_index,
            expected_term: prev_term,
            found_term: found,
            conflict_index,
        }
    }

    fn truncate_from(&mut self, index: u64) -> Result<()> {
        if let Some(pos) = self.position(index) {
            self.storage.truncate_log_from(index)?;
            warn!(from = index, dropped = self.entries.len() - pos, "truncated conflicting entries");
            self.entries.truncate(pos);
        }
        Ok(())
    }

    /// Advance the commit index and apply newly committed entries in order
    ///
    /// the commit index never moves backwards and never passes the tail. a
    /// failing apply is recorded in the report and the next entry still runs.
    pub fn commit_to<F>(&mut self, index: u64, mut apply: F) -> CommitReport
    where
        F: FnMut(&LogEntry) -> std::result::Result<(), ApplyError>,
    {
        let mut report = CommitReport::default();
        let target = index.min(self.last_index());
        if target <= self.commit_index {
            return report;
        }
        self.commit_index = target;

        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let Some(entry) = self.entry(next) else {
                break;
            };
            if let Err(err) = apply(entry) {
                warn!(index = next, error = %err, "apply failed");
                report.failures.push((next, err));
            }
            report.applied.push(next);
            self.last_applied = next;
        }

        debug!(commit_index = self.commit_index, applied = report.applied.len(), "commit advanced");
        report
    }

    /// Replace every entry up to `upto` with a snapshot
    ///
    /// returns false when `upto` is already covered by the current snapshot.
    pub fn compact(&mut self, upto: u64, state: Vec<u8>, peers: Vec<PeerInfo>) -> Result<bool> {
        if upto > self.commit_index {
            return Err(RaftError::Compaction {
                index: upto,
                reason: format!("commit index is {}", self.commit_index),
            });
        }
        if upto > self.last_applied {
            return Err(RaftError::Compaction {
                index: upto,
                reason: format!("last applied is {}", self.last_applied),
            });
        }
        if upto <= self.snapshot_index() {
            return Ok(false);
        }

        let pos = self.position(upto).ok_or_else(|| RaftError::Compaction {
            index: upto,
            reason: "entry is not in the log".to_string(),
        })?;
        let snapshot = Snapshot {
            last_index: upto,
            last_term: self.entries[pos].term,
            peers,
            state,
        };
        let retained = self.entries[pos + 1..].to_vec();

        self.storage.save_snapshot(&snapshot, &retained)?;
        info!(upto, retained = retained.len(), "compacted log");
        self.entries = retained;
        self.snapshot = Some(snapshot);
        Ok(true)
    }

    /// Install a snapshot received from the leader
    ///
    /// entries after the snapshot survive only if the log agrees with it at
    /// `last_index`. returns false when the snapshot is older than our commit.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<bool> {
        if snapshot.last_index <= self.commit_index {
            return Ok(false);
        }

        let retained = if self.term_at(snapshot.last_index) == Some(snapshot.last_term) {
            self.position(snapshot.last_index)
                .map_or_else(Vec::new, |pos| self.entries[pos + 1..].to_vec())
        } else {
            Vec::new()
        };

        self.storage.save_snapshot(&snapshot, &retained)?;
        info!(
            last_index = snapshot.last_index,
            last_term = snapshot.last_term,
            retained = retained.len(),
            "installed snapshot"
        );
        self.commit_index = snapshot.last_index;
        self.last_applied = snapshot.last_index;
        self.entries = retained;
        self.snapshot = Some(snapshot);
        Ok(true)
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("snapshot_index", &self.snapshot_index())
            .field("last_index", &self.last_index())
            .field("last_term", &self.last_term())
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("hard_state", &self.hard_state)
            .finish()
    }
}
