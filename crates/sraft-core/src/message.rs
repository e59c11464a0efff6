//! # message
//!
//! why: define the wire units exchanged between nodes of a zone
//! relations: produced and consumed by node.rs, framed by the sraft-chain transport
//! what: AppendShard and Vote request/response pairs, RpcRequest/RpcResponse envelopes

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// Replicate log entries (also serves as heartbeat when `entries` is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendShardRequest {
    pub term: u64,
    pub leader_id: String,
    pub zone_id: String,
    /// Index of the entry immediately preceding `entries`
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index` (0 when the log is empty)
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Response to [`AppendShardRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendShardResponse {
    pub success: bool,
    /// Responder's current term, lets the leader detect that it is stale
    pub term: u64,
    /// Highest index known to match the leader on success, a backtrack hint on failure
    pub match_index: u64,
}

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub zone_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Response to [`VoteRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote_granted: bool,
    pub term: u64,
}

/// Every request a node can receive from a zone peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    AppendShard(AppendShardRequest),
    Vote(VoteRequest),
}

impl RpcRequest {
    /// Zone the request is addressed to
    pub fn zone_id(&self) -> &str {
        match self {
            Self::AppendShard(req) => &req.zone_id,
            Self::Vote(req) => &req.zone_id,
        }
    }
}

/// Every response a node can send back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    AppendShard(AppendShardResponse),
    Vote(VoteResponse),
    /// The request could not be served (unknown zone, handler failure)
    Error(String),
}

/// Correlated frame carried over a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFrame<T> {
    pub id: u64,
    pub body: T,
}
