//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft_core::Storage; opened by raft-server for each node's data dir
//! what: FileStorage over a checksummed append-only record file plus a snapshot file
//!
//! layout of a data directory:
//! - raft.log: one record per line, `<crc32 hex8> <json>\n`. the first record is
//!   the hard state; later ones are entries, hard state updates and truncation
//!   markers, replayed in order
//! - snapshot.json: latest snapshot, replaced atomically

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use raft_core::{HardState, Log, LogEntry, PersistentState, RaftError, Result, Snapshot, Storage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const LOG_FILE: &str = "raft.log";
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// One line of raft.log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    HardState(HardState),
    Entry(LogEntry),
    Truncate { from: u64 },
}

/// file-based storage implementation using std::fs
///
/// every write is synced before returning, so a node may answer an rpc as
/// soon as the call comes back.
pub struct FileStorage {
    dir: PathBuf,
    /// append handle on raft.log
    file: File,
    /// last hard state written or loaded, needed when the log is rewritten
    hard_state: HardState,
}

impl FileStorage {
    /// Open or create storage in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let log_path = dir.join(LOG_FILE);
        if !log_path.exists() {
            write_log_file(&dir, &HardState::default(), &[])?;
            info!(dir = %dir.display(), "created raft log");
        }
        let file = OpenOptions::new().append(true).open(&log_path)?;

        Ok(Self {
            dir,
            file,
            hard_state: HardState::default(),
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn append_records(&mut self, records: &[Record]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            encode_record(record, &mut buf)?;
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let snapshot =
            serde_json::from_slice(&bytes).map_err(|e| RaftError::codec(SNAPSHOT_FILE, e))?;
        Ok(Some(snapshot))
    }

    fn reopen(&mut self) -> Result<()> {
        self.file = OpenOptions::new().append(true).open(self.log_path())?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> Result<()> {
        let hard_state = HardState {
            term,
            voted_for: voted_for.map(str::to_owned),
        };
        self.append_records(&[Record::HardState(hard_state.clone())])?;
        self.hard_state = hard_state;
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let records: Vec<Record> = entries.iter().cloned().map(Record::Entry).collect();
        self.append_records(&records)
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        self.append_records(&[Record::Truncate { from: from_index }])
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot, retained: &[LogEntry]) -> Result<()> {
        // snapshot first: a crash before the rewrite leaves entries the
        // snapshot already covers, which replay skips
        let json =
            serde_json::to_vec(snapshot).map_err(|e| RaftError::codec(SNAPSHOT_FILE, e))?;
        write_atomically(&self.dir, SNAPSHOT_FILE, &json)?;

        write_log_file(&self.dir, &self.hard_state, retained)?;
        self.reopen()?;
        debug!(
            last_index = snapshot.last_index,
            retained = retained.len(),
            "rewrote raft log after snapshot"
        );
        Ok(())
    }

    fn load(&mut self) -> Result<PersistentState> {
        let snapshot = self.read_snapshot()?;
        let base = snapshot.as_ref().map_or(0, |s| s.last_index);
        let mut state = PersistentState {
            snapshot,
            ..Default::default()
        };

        let bytes = fs::read(self.log_path())?;
        let mut offset = 0;
        let mut number = 0;

        while offset < bytes.len() {
            let rest = &bytes[offset..];
            let (line, complete) = match rest.iter().position(|&b| b == b'\n') {
                Some(end) => (&rest[..end], true),
                None => (rest, false),
            };
            let next = offset + line.len() + usize::from(complete);

            let decoded = if complete {
                decode_record(line)
            } else {
                Err("record is missing its terminator".to_string())
            };

            match decoded {
                Ok(record) => replay(&mut state, base, record, number)?,
                Err(reason) if next >= bytes.len() => {
                    warn!(record = number, %reason, "dropping torn record at end of raft log");
                    let file = OpenOptions::new().write(true).open(self.log_path())?;
                    file.set_len(offset as u64)?;
                    file.sync_data()?;
                    break;
                }
                Err(reason) => return Err(RaftError::CorruptLog { record: number, reason }),
            }

            offset = next;
            number += 1;
        }

        self.hard_state = state.hard_state.clone();
        info!(
            dir = %self.dir.display(),
            term = state.hard_state.term,
            snapshot_index = base,
            entries = state.entries.len(),
            "loaded raft storage"
        );
        Ok(state)
    }

    fn clear(&mut self) -> Result<()> {
        let snapshot_path = self.snapshot_path();
        if snapshot_path.exists() {
            fs::remove_file(snapshot_path)?;
        }
        self.hard_state = HardState::default();
        write_log_file(&self.dir, &self.hard_state, &[])?;
        self.reopen()
    }
}

/// Open a replicated log persisted in `dir`
pub fn open_log(dir: impl Into<PathBuf>) -> Result<Log> {
    Log::open(Box::new(FileStorage::open(dir)?))
}

fn replay(state: &mut PersistentState, base: u64, record: Record, number: usize) -> Result<()> {
    match record {
        Record::HardState(hard_state) => state.hard_state = hard_state,
        Record::Truncate { from } => state.entries.retain(|e| e.index < from),
        Record::Entry(entry) => {
            if entry.index <= base {
                return Ok(());
            }
            let expected = base + state.entries.len() as u64 + 1;
            if entry.index != expected {
                return Err(RaftError::CorruptLog {
                    record: number,
                    reason: format!("entry index {} where {} was expected", entry.index, expected),
                });
            }
            state.entries.push(entry);
        }
    }
    Ok(())
}

fn encode_record(record: &Record, buf: &mut Vec<u8>) -> Result<()> {
    let json = serde_json::to_vec(record).map_err(|e| RaftError::codec(LOG_FILE, e))?;
    write!(buf, "{:08x} ", crc32fast::hash(&json))?;
    buf.extend_from_slice(&json);
    buf.push(b'\n');
    Ok(())
}

fn decode_record(line: &[u8]) -> std::result::Result<Record, String> {
    if line.len() < 10 || line[8] != b' ' {
        return Err(format!("malformed record of {} bytes", line.len()));
    }
    let (checksum, json) = (&line[..8], &line[9..]);
    let expected = std::str::from_utf8(checksum)
        .ok()
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .ok_or_else(|| "unreadable checksum".to_string())?;
    let actual = crc32fast::hash(json);
    if actual != expected {
        return Err(format!("checksum mismatch: stored {expected:08x}, computed {actual:08x}"));
    }
    serde_json::from_slice(json).map_err(|e| format!("undecodable record: {e}"))
}

/// Write a fresh raft.log holding `hard_state` and `entries`
fn write_log_file(dir: &Path, hard_state: &HardState, entries: &[LogEntry]) -> Result<()> {
    let mut buf = Vec::new();
    encode_record(&Record::HardState(hard_state.clone()), &mut buf)?;
    for entry in entries {
        encode_record(&Record::Entry(entry.clone()), &mut buf)?;
    }
    write_atomically(dir, LOG_FILE, &buf)
}

// atomic write: write to temp file then rename
fn write_atomically(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}
