//! # node
//!
//! why: define the per-zone raft state machine and its state transitions
//! relations: uses message.rs for rpc types, log.rs for entries; driven by sraft-chain
//! what: NodeState enum, RaftNode struct, election, replication and commit bookkeeping

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::{AppendShardRequest, AppendShardResponse, VoteRequest, VoteResponse};
use crate::LogEntry;

/// The three possible states a zone participant can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Result of handling an [`AppendShardRequest`] on a follower.
///
/// Carries the log mutations so the caller can persist them before the
/// response leaves the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub response: AppendShardResponse,
    /// The request came from the legitimate leader of the current term
    pub reset_timer: bool,
    /// Entries at or above this index were dropped because they conflicted
    pub truncated_from: Option<u64>,
    /// Entries newly added to the log, in index order
    pub appended: Vec<LogEntry>,
}

/// What the leader learned from one [`AppendShardResponse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationProgress {
    /// Follower holds everything up to `match_index`
    Matched { match_index: u64, commit_advanced: bool },
    /// Follower refused (log gap or conflict); retry from `next_index`
    Rejected { next_index: u64 },
    /// Responder is at a higher term; this node stepped down
    StaleTerm { term: u64 },
    /// Response belongs to an older term or this node is no longer leader
    Ignored,
}

/// What a candidate learned from one [`VoteResponse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Majority reached, this node is now leader
    Won,
    /// Still collecting votes
    Pending,
    /// Responder is at a higher term; this node stepped down
    StaleTerm { term: u64 },
    /// Response belongs to an older election or this node is not campaigning
    Ignored,
}

/// One node's view of one zone
#[derive(Debug, Clone)]
pub struct RaftNode {
    /// This node's identifier (its address)
    pub id: String,
    /// Zone this state machine participates in
    pub zone_id: String,
    /// All zone members, self included
    pub cluster_nodes: Vec<String>,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number, never decreases
    pub current_term: u64,
    /// Candidate that received our vote in the current term (if any)
    pub voted_for: Option<String>,
    /// Last known leader of the current term
    pub leader_id: Option<String>,
    /// The replicated log, `log[i].index == i + 1`
    pub log: Vec<LogEntry>,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the ledger
    pub last_applied: u64,
    /// Voters that granted us their vote in the current election
    pub votes_received: Vec<String>,
    /// Per follower: next index to send (leader only)
    pub next_index: HashMap<String, u64>,
    /// Per follower: highest index known replicated (leader only)
    pub match_index: HashMap<String, u64>,
}

impl RaftNode {
    /// Create a new node in Follower state
    pub fn new(id: impl Into<String>, zone_id: impl Into<String>, cluster_nodes: Vec<String>) -> Self {
        Self {
            id: id.into(),
            zone_id: zone_id.into(),
            cluster_nodes,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Reload persisted state after a restart.
    ///
    /// `delivered` is how many entries the ledger already holds; those are
    /// committed by definition and must not be handed out again.
    pub fn restore(&mut self, term: u64, voted_for: Option<String>, log: Vec<LogEntry>, delivered: u64) {
        self.current_term = term;
        self.voted_for = voted_for;
        self.log = log;
        let delivered = delivered.min(self.last_log_index());
        self.commit_index = delivered;
        self.last_applied = delivered;
    }

    /// Zone members other than this node
    pub fn peers(&self) -> impl Iterator<Item = &String> + '_ {
        self.cluster_nodes.iter().filter(move |n| **n != self.id)
    }

    /// Majority of the zone, self included
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    /// Whether the votes collected so far form a majority
    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map_or(0, |e| e.index)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Term of the entry at `index`, 0 for the empty prefix or a missing entry
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.get_entry(index).map_or(0, |e| e.term)
    }

    /// Whether the entry created at (`index`, `term`) is committed on this node
    pub fn is_committed(&self, index: u64, term: u64) -> bool {
        self.commit_index >= index && self.get_term_at(index) == term
    }

    // -- role transitions --

    /// Start an election: bump the term, vote for self, and build the request
    /// to send to every peer.
    pub fn start_election(&mut self) -> VoteRequest {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.votes_received = vec![self.id.clone()];

        VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            zone_id: self.zone_id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Step back to follower. A higher term clears the vote; the same term keeps
    /// it so a voter never votes twice in one term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<String> = self.peers().cloned().collect();
        self.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = peers.into_iter().map(|p| (p, 0)).collect();
    }

    // -- election --

    /// Decide on a vote request. Returns the response and whether the election
    /// timer should be reset (a vote was granted).
    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> (VoteResponse, bool) {
        if request.zone_id != self.zone_id || request.term < self.current_term {
            return (self.vote_response(false), false);
        }
        if request.term > self.current_term {
            self.become_follower(request.term);
        }

        let log_ok = request.last_log_term > self.last_log_term()
            || (request.last_log_term == self.last_log_term()
                && request.last_log_index >= self.last_log_index());
        let can_vote = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == request.candidate_id,
        };

        if log_ok && can_vote {
            self.voted_for = Some(request.candidate_id.clone());
            (self.vote_response(true), true)
        } else {
            (self.vote_response(false), false)
        }
    }

    /// Tally one vote response while campaigning
    pub fn handle_vote_response(&mut self, from: &str, response: &VoteResponse) -> VoteOutcome {
        if response.term > self.current_term {
            self.become_follower(response.term);
            return VoteOutcome::StaleTerm { term: response.term };
        }
        if self.state != NodeState::Candidate || response.term != self.current_term {
            return VoteOutcome::Ignored;
        }

        if response.vote_granted && !self.votes_received.iter().any(|v| v == from) {
            self.votes_received.push(from.to_string());
        }
        if self.has_quorum() {
            self.become_leader();
            VoteOutcome::Won
        } else {
            VoteOutcome::Pending
        }
    }

    fn vote_response(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            vote_granted,
            term: self.current_term,
        }
    }

    // -- replication (leader side) --

    /// Append a new entry at the end of the log. Callers check leadership first.
    pub fn append_entry(&mut self, payload: Vec<u8>, config_seq: u64) -> LogEntry {
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, payload, config_seq);
        self.log.push(entry.clone());
        entry
    }

    /// Empty append used as a heartbeat, `None` unless leader
    pub fn create_heartbeat(&self) -> Option<AppendShardRequest> {
        if !self.is_leader() {
            return None;
        }
        let last = self.last_log_index();
        Some(self.append_request(last, Vec::new()))
    }

    /// Append carrying up to `max_entries` entries `peer` is missing
    pub fn create_append_shard(&self, peer: &str, max_entries: usize) -> Option<AppendShardRequest> {
        if !self.is_leader() {
            return None;
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1)
            .max(1);
        let prev = next - 1;
        let entries: Vec<LogEntry> = self
            .log
            .iter()
            .skip(prev as usize)
            .take(max_entries)
            .cloned()
            .collect();
        Some(self.append_request(prev, entries))
    }

    fn append_request(&self, prev_log_index: u64, entries: Vec<LogEntry>) -> AppendShardRequest {
        AppendShardRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            zone_id: self.zone_id.clone(),
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries,
            leader_commit: self.commit_index,
        }
    }

    /// Record a follower's answer to an append sent during `request_term`
    pub fn handle_append_shard_response(
        &mut self,
        from: &str,
        request_term: u64,
        response: &AppendShardResponse,
    ) -> ReplicationProgress {
        if response.term > self.current_term {
            self.become_follower(response.term);
            return ReplicationProgress::StaleTerm { term: response.term };
        }
        if !self.is_leader() || request_term != self.current_term {
            return ReplicationProgress::Ignored;
        }

        if response.success {
            let matched = self.match_index.entry(from.to_string()).or_insert(0);
            *matched = (*matched).max(response.match_index.min(self.log.len() as u64));
            let match_index = *matched;
            self.next_index.insert(from.to_string(), match_index + 1);
            let commit_advanced = self.advance_commit_index();
            ReplicationProgress::Matched {
                match_index,
                commit_advanced,
            }
        } else {
            let current = self
                .next_index
                .get(from)
                .copied()
                .unwrap_or(self.last_log_index() + 1);
            let next_index = current
                .saturating_sub(1)
                .min(response.match_index + 1)
                .max(1);
            self.next_index.insert(from.to_string(), next_index);
            ReplicationProgress::Rejected { next_index }
        }
    }

    /// Move `commit_index` to the highest current-term index stored on a
    /// majority. Earlier entries commit with it.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let quorum = self.quorum_size();
        let mut n = self.last_log_index();
        while n > self.commit_index {
            if self.get_term_at(n) != self.current_term {
                // older-term entries only commit through a current-term entry
                break;
            }
            let replicas = 1 + self.match_index.values().filter(|m| **m >= n).count();
            if replicas >= quorum {
                self.commit_index = n;
                return true;
            }
            n -= 1;
        }
        false
    }

    // -- replication (follower side) --

    /// Apply an append from a (claimed) leader
    pub fn handle_append_shard(&mut self, request: &AppendShardRequest) -> AppendOutcome {
        if request.zone_id != self.zone_id || request.term < self.current_term {
            return self.reject_append(self.last_log_index(), false);
        }

        // valid leader for this term: candidates and stale leaders yield
        self.become_follower(request.term);
        self.leader_id = Some(request.leader_id.clone());

        if request.prev_log_index > self.last_log_index() {
            return self.reject_append(self.last_log_index(), true);
        }
        if self.get_term_at(request.prev_log_index) != request.prev_log_term {
            let hint = request.prev_log_index.saturating_sub(1);
            return self.reject_append(hint, true);
        }

        let mut truncated_from = None;
        let mut appended = Vec::new();
        for entry in &request.entries {
            match self.get_entry(entry.index) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    // conflicting suffix is never committed, drop it
                    self.log.truncate((entry.index - 1) as usize);
                    truncated_from.get_or_insert(entry.index);
                }
                None => {}
            }
            self.log.push(entry.clone());
            appended.push(entry.clone());
        }

        let matched = request.prev_log_index + request.entries.len() as u64;
        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(matched).max(self.commit_index);
        }

        AppendOutcome {
            response: AppendShardResponse {
                success: true,
                term: self.current_term,
                match_index: matched,
            },
            reset_timer: true,
            truncated_from,
            appended,
        }
    }

    fn reject_append(&self, hint: u64, reset_timer: bool) -> AppendOutcome {
        AppendOutcome {
            response: AppendShardResponse {
                success: false,
                term: self.current_term,
                match_index: hint,
            },
            reset_timer,
            truncated_from: None,
            appended: Vec::new(),
        }
    }

    // -- delivery --

    /// Committed entries not yet handed out, advancing the delivery cursor
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let end = self.commit_index.min(self.last_log_index());
        if end <= self.last_applied {
            return Vec::new();
        }
        let entries = self.log[self.last_applied as usize..end as usize].to_vec();
        self.last_applied = end;
        entries
    }
}
