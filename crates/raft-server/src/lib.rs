//! # raft-server
//!
//! why: run raft-core nodes on tokio with timers, concurrent rpcs and a client api
//! relations: drives raft_core::RaftNode, persists through raft_storage::FileStorage
//! what: RaftServer actor, RaftHandle, Transport/RpcHandler, LocalNetwork, config, logging

pub mod config;
pub mod logging;
pub mod server;
pub mod transport;

pub use config::ServerConfig;
pub use logging::init_tracing;
pub use server::{Proposal, RaftHandle, RaftServer};
pub use transport::{LocalNetwork, LocalTransport, RpcHandler, Transport, TransportError};
