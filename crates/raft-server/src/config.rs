//! # config
//!
//! why: describe one member of a cluster well enough to open and start it
//! relations: consumed by RaftServer::open; embeds raft_core::RaftConfig
//! what: ServerConfig with json loading and validation

use std::path::PathBuf;

use raft_core::{NodeId, PeerInfo, RaftConfig, RaftError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// stable member name
    pub name: NodeId,
    /// address other members reach this node at
    pub address: String,
    /// directory holding raft.log and snapshot.json
    pub data_dir: PathBuf,
    /// initial members, self may be listed
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl ServerConfig {
    pub fn new(
        name: impl Into<NodeId>,
        address: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            data_dir: data_dir.into(),
            peers: Vec::new(),
            raft: RaftConfig::default(),
        }
    }

    pub fn with_peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RaftError::Config("node name must not be empty".to_string()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.name.as_str()) {
                return Err(RaftError::Config(format!("peer {} listed twice", peer.name)));
            }
        }
        self.raft.validate()
    }
}
