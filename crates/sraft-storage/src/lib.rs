//! # sraft-storage
//!
//! why: keep a zone's term, vote and log across restarts using standard rust fs apis
//! relations: loaded and written by sraft-chain before any vote or ack leaves the node
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use sraft_core::LogEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

/// trait for durable storage of one zone's consensus state
///
/// this abstraction allows the same chain code to work with:
/// - real filesystem (production)
/// - in-memory (testing, simulations)
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> io::Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> io::Result<(u64, Option<String>)>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// drop every entry with index >= from_index (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores state in a directory with:
/// - meta.json: term and voted_for, replaced atomically
/// - log.jsonl: one json entry per line, append-only except on truncation
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// write `bytes` to a temp file then rename it over `target`
    fn replace_file(&self, target: PathBuf, bytes: &[u8]) -> io::Result<()> {
        let temp_path = target.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;
        Ok(())
    }

    /// fix a log whose last line has no newline: cut it off at `keep` bytes,
    /// or terminate it when `keep` is none
    fn repair_tail(&self, keep: Option<u64>) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(self.log_path())?;
        match keep {
            Some(len) => file.set_len(len)?,
            None => file.write_all(b"\n")?,
        }
        file.sync_all()
    }

    fn encode_lines(entries: &[LogEntry]) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry).map_err(invalid_data)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

/// metadata structure for term and vote
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    term: u64,
    voted_for: Option<String>,
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> io::Result<()> {
        let meta = MetaData {
            term,
            voted_for: voted_for.map(str::to_string),
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(invalid_data)?;
        self.replace_file(self.meta_path(), &json)
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<String>)> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None)); // default for new nodes
        }

        let contents = fs::read(&path)?;
        let meta: MetaData = serde_json::from_slice(&contents).map_err(invalid_data)?;

        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&Self::encode_lines(entries)?)?;
        file.sync_all()?;

        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let bytes = fs::read(&path)?;
        // everything up to the last newline was fully written
        let (complete, tail) = match bytes.iter().rposition(|&b| b == b'\n') {
            Some(end) => bytes.split_at(end + 1),
            None => bytes.split_at(0),
        };

        let mut log = Vec::new();
        for line in complete.split(|&b| b == b'\n') {
            if is_blank(line) {
                continue;
            }
            let entry: LogEntry = serde_json::from_slice(line).map_err(invalid_data)?;
            log.push(entry);
        }

        if !is_blank(tail) {
            match serde_json::from_slice::<LogEntry>(tail) {
                // only the newline was lost; terminate the line so appends stay separate
                Ok(entry) => {
                    log.push(entry);
                    self.repair_tail(None)?;
                }
                // torn write from a crash mid-append, never acknowledged
                Err(_) => self.repair_tail(Some(complete.len() as u64))?,
            }
        }

        Ok(log)
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        let mut log = self.load_log()?;
        log.retain(|e| e.index < from_index);
        self.replace_file(self.log_path(), &Self::encode_lines(&log)?)
    }

    fn clear(&mut self) -> io::Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Default, Clone)]
pub struct InMemoryStorage {
    term: u64,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for.map(str::to_string);
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<String>)> {
        Ok((self.term, self.voted_for.clone()))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.term = 0;
        self.voted_for = None;
        self.log.clear();
        Ok(())
    }
}
