//! # support
//!
//! why: narrow boundary to the ledger and channel configuration owned elsewhere
//! relations: chain.rs writes committed entries through it, one call per entry, in order
//! what: ChainSupport trait, MemoryLedger reference implementation

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sraft_core::LogEntry;

/// Collaborator that owns ledger persistence and channel configuration
pub trait ChainSupport: Send + Sync {
    /// Write one committed entry to the ledger
    fn append(&self, entry: &LogEntry) -> anyhow::Result<()>;

    /// Current channel configuration sequence number
    fn sequence(&self) -> u64;

    /// Number of entries the ledger already holds
    fn height(&self) -> u64;

    /// Zone membership as known by the channel configuration, if it overrides
    /// the static topology
    fn zone_members(&self, _zone_id: &str) -> Option<Vec<String>> {
        None
    }
}

/// Ledger kept in memory, for tests and single-process simulations
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LogEntry>>,
    sequence: AtomicU64,
    failures: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::SeqCst);
    }

    /// Make the next `count` appends fail
    pub fn fail_next(&self, count: u64) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl ChainSupport for MemoryLedger {
    fn append(&self, entry: &LogEntry) -> anyhow::Result<()> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            anyhow::bail!("ledger unavailable");
        }

        let mut entries = self.entries.lock();
        let expected = entries.len() as u64 + 1;
        anyhow::ensure!(
            entry.index == expected,
            "out of order ledger write: got index {}, expected {expected}",
            entry.index
        );
        entries.push(entry.clone());
        Ok(())
    }

    fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn height(&self) -> u64 {
        self.entries.lock().len() as u64
    }
}
