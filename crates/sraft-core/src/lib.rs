//! # sraft-core
//!
//! why: implement the per-zone consensus rules in pure, portable rust
//! relations: used by sraft-chain for the async runtime, sraft-storage for persistence
//! what: zone state machine, election and commit rules, wire messages, configuration

pub mod config;
pub mod log;
pub mod message;
pub mod node;

pub use config::{Config, ConfigError, ZoneConfig};
pub use log::LogEntry;
pub use message::{
    AppendShardRequest, AppendShardResponse, RpcFrame, RpcRequest, RpcResponse, VoteRequest,
    VoteResponse,
};
pub use node::{AppendOutcome, NodeState, RaftNode, ReplicationProgress, VoteOutcome};
