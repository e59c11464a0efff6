//! # log
//!
//! why: describe one ordered unit of a zone's replicated log
//! relations: built by node.rs on the leader, shipped in message.rs, persisted via sraft-storage
//! what: LogEntry struct

use serde::{Deserialize, Serialize};

/// A single entry in a zone's replicated log.
///
/// Entries are created by the zone leader and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed, contiguous)
    pub index: u64,
    /// Opaque transaction bytes submitted by the front end
    pub payload: Vec<u8>,
    /// Channel configuration sequence the transaction was validated against
    pub config_seq: u64,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, payload: Vec<u8>, config_seq: u64) -> Self {
        Self {
            term,
            index,
            payload,
            config_seq,
        }
    }
}
