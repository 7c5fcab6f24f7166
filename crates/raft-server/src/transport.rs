//! # transport
//!
//! why: keep the node runtime independent of how rpcs travel between members
//! relations: server.rs sends through Transport and answers through RpcHandler
//! what: Transport and RpcHandler traits, TransportError, in-process LocalNetwork

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, PeerInfo, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use thiserror::Error;
use tracing::debug;

/// Why an rpc produced no response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("link to {0} is partitioned")]
    Partitioned(NodeId),

    #[error("rpc to {peer} timed out after {millis} ms")]
    Timeout { peer: NodeId, millis: u64 },

    #[error("peer {peer} failed the rpc: {reason}")]
    Remote { peer: NodeId, reason: String },
}

/// Client side of the three raft rpcs; must be safe to call concurrently
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_request_vote(
        &self,
        to: &PeerInfo,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn send_append_entries(
        &self,
        to: &PeerInfo,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn send_install_snapshot(
        &self,
        to: &PeerInfo,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError>;
}

/// Server side of the three raft rpcs
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_request_vote(&self, request: VoteRequest) -> raft_core::Result<VoteResponse>;

    async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> raft_core::Result<AppendEntriesResponse>;

    async fn handle_install_snapshot(
        &self,
        request: SnapshotRequest,
    ) -> raft_core::Result<SnapshotResponse>;
}

#[derive(Default)]
struct Links {
    handlers: HashMap<NodeId, Arc<dyn RpcHandler>>,
    /// directed pairs (from, to) that drop traffic
    cut: BTreeSet<(NodeId, NodeId)>,
    isolated: BTreeSet<NodeId>,
}

/// In-process network connecting nodes of one test or embedding
///
/// links can be cut and healed to simulate partitions.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    links: Arc<Mutex<Links>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `name` reachable through `handler`
    pub fn register(&self, name: impl Into<NodeId>, handler: Arc<dyn RpcHandler>) {
        self.links().handlers.insert(name.into(), handler);
    }

    /// A transport sending on behalf of `from`
    pub fn transport(&self, from: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: from.into(),
            network: self.clone(),
        })
    }

    /// Drop traffic between `a` and `b` in both directions
    pub fn partition(&self, a: &str, b: &str) {
        let mut links = self.links();
        links.cut.insert((a.to_string(), b.to_string()));
        links.cut.insert((b.to_string(), a.to_string()));
    }

    /// Drop all traffic to and from `name`
    pub fn isolate(&self, name: &str) {
        self.links().isolated.insert(name.to_string());
    }

    /// Restore every link
    pub fn heal(&self) {
        let mut links = self.links();
        links.cut.clear();
        links.isolated.clear();
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<dyn RpcHandler>, TransportError> {
        let links = self.links();
        if links.isolated.contains(from)
            || links.isolated.contains(to)
            || links.cut.contains(&(from.to_string(), to.to_string()))
        {
            return Err(TransportError::Partitioned(to.to_string()));
        }
        links
            .handlers
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))
    }
}

/// One member's view of a LocalNetwork
pub struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    fn remote(to: &PeerInfo, err: raft_core::RaftError) -> TransportError {
        TransportError::Remote {
            peer: to.name.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_request_vote(
        &self,
        to: &PeerInfo,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        let handler = self.network.route(&self.from, &to.name)?;
        debug!(from = %self.from, to = %to.name, term = request.term, "request vote");
        handler
            .handle_request_vote(request)
            .await
            .map_err(|e| Self::remote(to, e))
    }

    async fn send_append_entries(
        &self,
        to: &PeerInfo,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let handler = self.network.route(&self.from, &to.name)?;
        handler
            .handle_append_entries(request)
            .await
            .map_err(|e| Self::remote(to, e))
    }

    async fn send_install_snapshot(
        &self,
        to: &PeerInfo,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError> {
        let handler = self.network.route(&self.from, &to.name)?;
        debug!(from = %self.from, to = %to.name, last_index = request.snapshot.last_index, "install snapshot");
        handler
            .handle_install_snapshot(request)
            .await
            .map_err(|e| Self::remote(to, e))
    }
}
