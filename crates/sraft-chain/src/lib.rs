//! # sraft-chain
//!
//! why: run each zone's raft state machine as a live ordering service
//! relations: drives sraft-core, persists with sraft-storage, talks to peers over tokio
//! what: Chain, replication and elections, TCP and in-process transports, consenter registry

mod chain;
mod election;
mod error;
mod local;
mod registry;
mod replicator;
mod server;
mod support;
mod transport;

pub use chain::{Chain, ChainOptions, ChainStatus};
pub use error::{ChainError, Result};
pub use local::LocalNetwork;
pub use registry::{
    ChainContext, ConsensusChain, ConsenterFactory, ConsenterRegistry, CONTRACT_VERSION, SRAFT,
};
pub use server::{RpcHandler, RpcServer, ZoneRouter};
pub use support::{ChainSupport, MemoryLedger};
pub use transport::{Connector, PeerClient, ReplicationTransport, TcpConnector, TransportError};

pub use sraft_core::{Config, LogEntry, NodeState};
