//! # config
//!
//! why: collect the timing and batching knobs of a node in one serializable place
//! relations: owned by node.rs; validated by raft-server before a node starts
//! what: RaftConfig with defaults, validation, duration helpers, json loading

use std::ops::Range;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Timing and batching configuration for a raft node (all times in ms)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout
    pub election_timeout_min: u64,
    /// Maximum election timeout (exclusive)
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats
    pub heartbeat_interval: u64,
    /// Upper bound on a single rpc round trip
    pub rpc_timeout: u64,
    /// Most entries carried by one AppendEntries request
    pub max_entries_per_message: usize,
    /// Compact once more than this many applied entries are held; None disables it
    pub compaction_threshold: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_entries_per_message: 64,
            compaction_threshold: None,
        }
    }
}

impl RaftConfig {
    /// Parse a json document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 || self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout range {}..{} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval {} must be below the election timeout {}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.rpc_timeout == 0 || self.rpc_timeout >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "rpc timeout {} must be below the election timeout {}",
                self.rpc_timeout, self.election_timeout_min
            )));
        }
        if self.max_entries_per_message == 0 {
            return Err(RaftError::Config(
                "max_entries_per_message must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn election_timeout_range(&self) -> Range<u64> {
        self.election_timeout_min..self.election_timeout_max
    }

    /// A fresh randomized election timeout
    pub fn random_election_timeout(&self) -> Duration {
        let range = self.election_timeout_range();
        let millis = if range.is_empty() {
            self.election_timeout_min
        } else {
            rand::thread_rng().gen_range(range)
        };
        Duration::from_millis(millis)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}
