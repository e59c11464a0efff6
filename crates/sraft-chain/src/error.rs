//! # error
//!
//! why: give callers of a chain one taxonomy of failures to act on
//! relations: returned by chain.rs and registry.rs; transport failures stay in transport.rs
//! what: ChainError, Result alias

use std::io;
use std::time::Duration;

use sraft_core::ConfigError;
use thiserror::Error;

/// Failures surfaced to the front end and to whoever builds chains
#[derive(Debug, Error)]
pub enum ChainError {
    /// This node does not lead the zone; retry against `leader` when known
    #[error("not the zone leader (last known leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    /// A higher term was observed while the submission was replicating
    #[error("leadership lost to term {term} during replication")]
    LeadershipLost { term: u64 },

    /// No majority acknowledged the entry within the wait budget
    #[error("entry {index} not acknowledged by a quorum within {waited:?}")]
    QuorumUnreachable { index: u64, waited: Duration },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),

    /// The chain was stopped
    #[error("chain is halted")]
    Halted,

    #[error("no consenter registered under {name:?}")]
    UnknownConsenter { name: String },

    #[error("consenter contract version {requested} is not supported (have {supported})")]
    IncompatibleContract { requested: u32, supported: u32 },
}

pub type Result<T, E = ChainError> = std::result::Result<T, E>;

impl ChainError {
    /// Whether submitting the same payload again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::LeadershipLost { .. } | Self::QuorumUnreachable { .. }
        )
    }
}
