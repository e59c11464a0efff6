//! # chain
//!
//! why: own one zone's consensus state on this node and expose ordering to the front end
//! relations: drives sraft-core's RaftNode, persists through sraft-storage, delivers through
//!            support.rs; replicator.rs and election.rs work only through ChainCore
//! what: Chain, ChainOptions, ChainStatus, ChainCore (the single lock around zone state)

use std::collections::HashMap;
use std::io;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sraft_core::{
    AppendOutcome, AppendShardRequest, AppendShardResponse, Config, ConfigError, LogEntry,
    NodeState, RaftNode, ReplicationProgress, RpcRequest, RpcResponse, VoteOutcome, VoteRequest,
    VoteResponse,
};
use sraft_storage::Storage;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::election::ElectionManager;
use crate::error::{ChainError, Result};
use crate::replicator::{Peer, ShardReplicator};
use crate::server::RpcHandler;
use crate::support::ChainSupport;
use crate::transport::Connector;

/// Which zone a chain orders for and who this node is in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOptions {
    /// This node's address, as listed in the zone
    pub node_id: String,
    pub zone_id: String,
}

impl ChainOptions {
    pub fn new(node_id: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            zone_id: zone_id.into(),
        }
    }
}

/// Observable summary of a chain, republished after every state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStatus {
    pub term: u64,
    pub role: NodeState,
    pub leader: Option<String>,
    pub commit_index: u64,
    pub last_index: u64,
    pub halted: bool,
}

impl ChainStatus {
    pub fn is_leader(&self) -> bool {
        self.role == NodeState::Leader && !self.halted
    }
}

struct ChainState {
    node: RaftNode,
    storage: Box<dyn Storage>,
    election_deadline: Instant,
    /// term and vote last written to storage
    persisted: (u64, Option<String>),
}

impl ChainState {
    /// Write term and vote if they changed since the last write
    fn persist_hard_state(&mut self) -> io::Result<()> {
        if self.persisted.0 == self.node.current_term && self.persisted.1 == self.node.voted_for {
            return Ok(());
        }
        self.storage
            .save_term_and_vote(self.node.current_term, self.node.voted_for.as_deref())?;
        self.persisted = (self.node.current_term, self.node.voted_for.clone());
        Ok(())
    }

    /// Undo an inbound append whose writes did not all reach storage: the log
    /// is reloaded from disk and the fields the append touched are restored.
    fn roll_back(&mut self, saved: AppendRollback) -> io::Result<()> {
        let log = self.storage.load_log()?;
        self.node.log = log;
        saved.restore(&mut self.node);
        // a term that already reached disk is never taken back
        let (term, voted_for) = self.persisted.clone();
        if term > self.node.current_term {
            self.node.become_follower(term);
            self.node.voted_for = voted_for;
        }
        self.node.commit_index = self.node.commit_index.min(self.node.last_log_index());
        Ok(())
    }

    fn status(&self, halted: bool) -> ChainStatus {
        ChainStatus {
            term: self.node.current_term,
            role: self.node.state,
            leader: self.node.leader_id.clone(),
            commit_index: self.node.commit_index,
            last_index: self.node.last_log_index(),
            halted,
        }
    }
}

/// Node fields an inbound append may change, captured before it is applied
struct AppendRollback {
    state: NodeState,
    term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    commit_index: u64,
    votes_received: Vec<String>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
}

impl AppendRollback {
    fn capture(node: &RaftNode) -> Self {
        Self {
            state: node.state,
            term: node.current_term,
            voted_for: node.voted_for.clone(),
            leader_id: node.leader_id.clone(),
            commit_index: node.commit_index,
            votes_received: node.votes_received.clone(),
            next_index: node.next_index.clone(),
            match_index: node.match_index.clone(),
        }
    }

    fn restore(self, node: &mut RaftNode) {
        node.state = self.state;
        node.current_term = self.term;
        node.voted_for = self.voted_for;
        node.leader_id = self.leader_id;
        node.commit_index = self.commit_index;
        node.votes_received = self.votes_received;
        node.next_index = self.next_index;
        node.match_index = self.match_index;
    }
}

/// Where the election timer stands
pub(crate) enum ElectionTick {
    Due,
    Wait(Instant),
}

/// First step of a campaign
pub(crate) enum CampaignStart {
    Solicit(VoteRequest),
    Won,
    Aborted,
}

/// Fate of one proposed entry as seen by the leader
pub(crate) enum CommitCheck {
    Committed,
    Pending,
    Lost { term: u64 },
}

/// State and collaborators shared by the chain, its replicator and its election timer
pub(crate) struct ChainCore {
    pub(crate) node_id: String,
    pub(crate) zone_id: String,
    pub(crate) config: Arc<Config>,
    support: Arc<dyn ChainSupport>,
    state: Mutex<ChainState>,
    status: watch::Sender<ChainStatus>,
    delivery: tokio::sync::Mutex<()>,
    pub(crate) replicator: ShardReplicator,
    pub(crate) election: ElectionManager,
    pub(crate) shutdown: CancellationToken,
}

impl ChainCore {
    pub(crate) fn is_halted(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.state.lock().node.is_leader()
    }

    pub(crate) fn last_log_index(&self) -> u64 {
        self.state.lock().node.last_log_index()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ChainStatus> {
        self.status.subscribe()
    }

    fn publish(&self, state: &ChainState) {
        let next = state.status(self.is_halted());
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
    }

    fn reset_election_deadline(&self, state: &mut ChainState) {
        state.election_deadline = Instant::now() + self.election.next_timeout();
    }

    fn log_step_down(&self, state: &ChainState, reason: &str) {
        info!(
            zone = %self.zone_id,
            node = %self.node_id,
            term = state.node.current_term,
            reason,
            "stepped down to follower"
        );
    }

    // -- leader path --

    /// Append a new entry locally; the entry is durable before this returns
    pub(crate) fn propose(&self, payload: Vec<u8>, config_seq: u64) -> Result<LogEntry> {
        let mut state = self.state.lock();
        if !state.node.is_leader() {
            return Err(ChainError::NotLeader {
                leader: state.node.leader_id.clone(),
            });
        }

        let entry = state.node.append_entry(payload, config_seq);
        if let Err(error) = state.storage.append_entries(slice::from_ref(&entry)) {
            state.node.log.pop();
            return Err(error.into());
        }
        // a zone of one commits on its own vote
        state.node.advance_commit_index();
        debug!(zone = %self.zone_id, term = entry.term, index = entry.index, "entry proposed");
        self.publish(&state);
        Ok(entry)
    }

    pub(crate) fn commit_state(&self, index: u64, term: u64) -> CommitCheck {
        let state = self.state.lock();
        let node = &state.node;
        if node.is_committed(index, term) {
            CommitCheck::Committed
        } else if !node.is_leader() || node.current_term != term || node.get_term_at(index) != term {
            CommitCheck::Lost {
                term: node.current_term,
            }
        } else {
            CommitCheck::Pending
        }
    }

    /// Append for `peer` carrying what it is missing, with the term it was built in
    pub(crate) fn build_append(&self, peer: &str) -> Option<(AppendShardRequest, u64)> {
        let state = self.state.lock();
        state
            .node
            .create_append_shard(peer, self.replicator.max_batch_size())
            .map(|request| {
                let term = request.term;
                (request, term)
            })
    }

    pub(crate) fn on_append_response(
        &self,
        peer: &str,
        request_term: u64,
        response: &AppendShardResponse,
    ) -> ReplicationProgress {
        let mut state = self.state.lock();
        let progress = state
            .node
            .handle_append_shard_response(peer, request_term, response);

        match progress {
            ReplicationProgress::StaleTerm { term } => {
                if let Err(error) = state.persist_hard_state() {
                    error!(%error, term, "failed to persist term");
                }
                self.reset_election_deadline(&mut state);
                self.log_step_down(&state, "peer reported a higher term");
            }
            ReplicationProgress::Matched {
                commit_advanced: true,
                ..
            } => {
                debug!(
                    zone = %self.zone_id,
                    commit_index = state.node.commit_index,
                    "commit index advanced"
                );
            }
            ReplicationProgress::Rejected { next_index } => {
                debug!(zone = %self.zone_id, peer, next_index, "append rejected, backing up");
            }
            _ => {}
        }

        self.publish(&state);
        progress
    }

    // -- elections --

    pub(crate) fn poll_election(&self) -> ElectionTick {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state.node.is_leader() {
            self.reset_election_deadline(&mut state);
            return ElectionTick::Wait(state.election_deadline);
        }
        if now >= state.election_deadline {
            ElectionTick::Due
        } else {
            ElectionTick::Wait(state.election_deadline)
        }
    }

    pub(crate) fn begin_campaign(&self) -> CampaignStart {
        let mut state = self.state.lock();
        if state.node.is_leader() {
            return CampaignStart::Won;
        }

        let request = state.node.start_election();
        self.reset_election_deadline(&mut state);
        if let Err(error) = state.persist_hard_state() {
            // never solicit votes for a term that is not on disk
            error!(%error, term = request.term, "failed to persist election term");
            let term = state.node.current_term;
            state.node.become_follower(term);
            self.publish(&state);
            return CampaignStart::Aborted;
        }
        info!(zone = %self.zone_id, node = %self.node_id, term = request.term, "starting election");

        let start = if state.node.has_quorum() {
            state.node.become_leader();
            info!(zone = %self.zone_id, node = %self.node_id, term = request.term, "elected leader");
            CampaignStart::Won
        } else {
            CampaignStart::Solicit(request)
        };
        self.publish(&state);
        start
    }

    pub(crate) fn on_vote_response(&self, peer: &str, response: &VoteResponse) -> VoteOutcome {
        let mut state = self.state.lock();
        let outcome = state.node.handle_vote_response(peer, response);

        match outcome {
            VoteOutcome::Won => {
                info!(
                    zone = %self.zone_id,
                    node = %self.node_id,
                    term = state.node.current_term,
                    "elected leader"
                );
            }
            VoteOutcome::StaleTerm { term } => {
                if let Err(error) = state.persist_hard_state() {
                    error!(%error, term, "failed to persist term");
                }
                self.reset_election_deadline(&mut state);
                self.log_step_down(&state, "voter reported a higher term");
            }
            VoteOutcome::Pending | VoteOutcome::Ignored => {}
        }

        self.publish(&state);
        outcome
    }

    pub(crate) fn is_candidate_in(&self, term: u64) -> bool {
        let state = self.state.lock();
        state.node.state == NodeState::Candidate && state.node.current_term == term
    }

    // -- follower path --

    fn handle_vote(&self, request: &VoteRequest) -> RpcResponse {
        let mut state = self.state.lock();
        let was = state.node.state;
        let (response, granted) = state.node.handle_vote_request(request);

        if let Err(error) = state.persist_hard_state() {
            error!(%error, term = request.term, "failed to persist vote");
            return RpcResponse::Error(format!("storage failure: {error}"));
        }
        if granted {
            self.reset_election_deadline(&mut state);
            debug!(
                zone = %self.zone_id,
                term = request.term,
                candidate = %request.candidate_id,
                "vote granted"
            );
        }
        if was != NodeState::Follower && state.node.state == NodeState::Follower {
            self.log_step_down(&state, "candidate with a higher term");
        }

        self.publish(&state);
        RpcResponse::Vote(response)
    }

    fn handle_append(&self, request: &AppendShardRequest) -> RpcResponse {
        let mut state = self.state.lock();
        let was = state.node.state;
        let saved = AppendRollback::capture(&state.node);
        let outcome = state.node.handle_append_shard(request);

        if let Err(error) = self.write_append(&mut state, &outcome) {
            error!(%error, term = request.term, "failed to persist append, rolling back");
            if let Err(reload) = state.roll_back(saved) {
                // memory may now hold entries storage lacks; acking them is unsafe
                error!(error = %reload, "failed to reload log after write failure, halting");
                self.shutdown.cancel();
            }
            self.publish(&state);
            return RpcResponse::Error(format!("storage failure: {error}"));
        }

        if outcome.reset_timer {
            self.reset_election_deadline(&mut state);
        }
        if was != NodeState::Follower && state.node.state == NodeState::Follower {
            self.log_step_down(&state, "append from the current leader");
        }

        self.publish(&state);
        RpcResponse::AppendShard(outcome.response)
    }

    /// Make an applied append durable: term and vote, then the truncation, then new entries
    fn write_append(&self, state: &mut ChainState, outcome: &AppendOutcome) -> io::Result<()> {
        state.persist_hard_state()?;
        if let Some(from) = outcome.truncated_from {
            warn!(zone = %self.zone_id, from, "dropping conflicting log suffix");
            state.storage.truncate_log_from(from)?;
        }
        state.storage.append_entries(&outcome.appended)
    }

    // -- delivery --

    /// Hand newly committed entries to the ledger, in order and exactly once.
    ///
    /// On a ledger failure the cursor is moved back to the failed entry and
    /// the next pass retries from there.
    pub(crate) async fn deliver_committed(&self) {
        let _delivering = self.delivery.lock().await;
        loop {
            let entries = self.state.lock().node.get_entries_to_apply();
            if entries.is_empty() {
                return;
            }

            for entry in &entries {
                if let Err(error) = self.support.append(entry) {
                    warn!(
                        zone = %self.zone_id,
                        index = entry.index,
                        error = %error,
                        "ledger write failed, will retry"
                    );
                    let mut state = self.state.lock();
                    let rewound = state.node.last_applied.min(entry.index - 1);
                    state.node.last_applied = rewound;
                    return;
                }
                debug!(zone = %self.zone_id, index = entry.index, "entry delivered");
            }
        }
    }

    /// Retry ledger delivery that failed earlier, once per heartbeat interval
    pub(crate) async fn run_redelivery(core: Arc<ChainCore>) {
        let mut ticker = interval(core.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = core.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if core.has_undelivered() {
                core.deliver_committed().await;
            }
        }
    }

    pub(crate) fn has_undelivered(&self) -> bool {
        let state = self.state.lock();
        state.node.last_applied < state.node.commit_index.min(state.node.last_log_index())
    }

    fn halt(&self) {
        self.shutdown.cancel();
        let state = self.state.lock();
        self.publish(&state);
    }
}

/// One zone's ordering service on this node
pub struct Chain {
    core: Arc<ChainCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Chain {
    /// Validate membership, recover persisted state and connect to zone peers.
    ///
    /// No timer runs until [`Chain::start`]; the chain already answers peer
    /// calls and [`Chain::campaign`], and the first order starts replication.
    pub fn new(
        options: ChainOptions,
        config: Arc<Config>,
        support: Arc<dyn ChainSupport>,
        storage: Box<dyn Storage>,
        connector: &dyn Connector,
    ) -> Result<Arc<Self>> {
        let ChainOptions { node_id, zone_id } = options;
        let zone = config.zone(&zone_id).ok_or_else(|| ConfigError::UnknownZone {
            zone: zone_id.clone(),
        })?;
        let members = support
            .zone_members(&zone_id)
            .unwrap_or_else(|| zone.nodes.clone());
        if members.is_empty() {
            return Err(ConfigError::EmptyZone { zone: zone_id }.into());
        }
        if !members.contains(&node_id) {
            return Err(ConfigError::NotAMember {
                zone: zone_id,
                node: node_id,
            }
            .into());
        }

        let (term, voted_for) = storage.load_term_and_vote()?;
        let log = storage.load_log()?;
        let mut node = RaftNode::new(node_id.clone(), zone_id.clone(), members);
        node.restore(term, voted_for.clone(), log, support.height());

        let peers = node
            .peers()
            .map(|peer| Peer::new(peer.clone(), connector.connect(&node_id, peer)))
            .collect();
        let replicator = ShardReplicator::new(peers, config.max_batch_size(), config.heartbeat_interval());
        let election = ElectionManager::new(config.election_timeout());

        let state = ChainState {
            election_deadline: Instant::now() + election.next_timeout(),
            persisted: (term, voted_for),
            node,
            storage,
        };
        let (status, _) = watch::channel(state.status(false));

        info!(
            zone = %zone_id,
            node = %node_id,
            term,
            last_index = state.node.last_log_index(),
            delivered = state.node.last_applied,
            "chain restored"
        );

        let core = ChainCore {
            node_id,
            zone_id,
            config,
            support,
            state: Mutex::new(state),
            status,
            delivery: tokio::sync::Mutex::new(()),
            replicator,
            election,
            shutdown: CancellationToken::new(),
        };

        Ok(Arc::new(Self {
            core: Arc::new(core),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.core.node_id
    }

    pub fn zone_id(&self) -> &str {
        &self.core.zone_id
    }

    /// Launch the election timer, the per-follower replication tasks and the
    /// delivery retry loop. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.core.is_halted() {
            return Err(ChainError::Halted);
        }
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        {
            let mut state = self.core.state.lock();
            self.core.reset_election_deadline(&mut state);
        }
        tasks.push(tokio::spawn(ElectionManager::run(self.core.clone())));
        tasks.push(tokio::spawn(ChainCore::run_redelivery(self.core.clone())));
        self.core.replicator.spawn_followers(&self.core);
        info!(zone = %self.core.zone_id, node = %self.core.node_id, "chain started");
        Ok(())
    }

    /// Halt every loop; no timer fires afterwards and every later call fails with `Halted`
    pub fn stop(&self) {
        self.core.halt();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.core.replicator.stop_followers();
        info!(zone = %self.core.zone_id, node = %self.core.node_id, "chain stopped");
    }

    /// Order `payload` within the configured order timeout
    pub async fn order(&self, payload: Vec<u8>, config_seq: u64) -> Result<u64> {
        self.order_with_timeout(payload, config_seq, self.core.config.order_timeout())
            .await
    }

    /// Append `payload` to the zone log and wait until a quorum holds it.
    ///
    /// Returns the entry's index. If the caller stops waiting the entry may
    /// still commit later; it is delivered to the ledger at most once either way.
    pub async fn order_with_timeout(
        &self,
        payload: Vec<u8>,
        config_seq: u64,
        wait: Duration,
    ) -> Result<u64> {
        if self.core.is_halted() {
            return Err(ChainError::Halted);
        }
        let current_seq = self.core.support.sequence();
        if config_seq < current_seq {
            warn!(
                zone = %self.core.zone_id,
                config_seq,
                current_seq,
                "ordering entry built against an older channel configuration"
            );
        }

        let started = Instant::now();
        let entry = self.core.propose(payload, config_seq)?;
        self.core
            .replicator
            .replicate(&self.core, &entry, started + wait)
            .await?;

        self.core.deliver_committed().await;
        Ok(entry.index)
    }

    /// Start an election now instead of waiting for the timer. Returns whether
    /// this node leads the zone afterwards.
    pub async fn campaign(&self) -> Result<bool> {
        if self.core.is_halted() {
            return Err(ChainError::Halted);
        }
        Ok(self.core.election.campaign(&self.core).await)
    }

    pub fn status(&self) -> ChainStatus {
        self.core.status.borrow().clone()
    }

    /// Status updates, starting from the current one
    pub fn subscribe(&self) -> watch::Receiver<ChainStatus> {
        self.core.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.status().is_leader()
    }

    /// Leader of the highest-priority zone. Cross-zone coordination hangs off
    /// this; the chain itself does not act on it.
    pub fn is_root_leader(&self) -> bool {
        self.core.config.root_zone() == Some(self.core.zone_id.as_str()) && self.is_leader()
    }

    /// Copy of the local log
    pub fn entries(&self) -> Vec<LogEntry> {
        self.core.state.lock().node.log.clone()
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.core.replicator.stop_followers();
    }
}

#[async_trait]
impl RpcHandler for Chain {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        if self.core.is_halted() {
            return RpcResponse::Error("chain is halted".to_string());
        }
        match request {
            RpcRequest::Vote(request) => self.core.handle_vote(&request),
            RpcRequest::AppendShard(request) => {
                let response = self.core.handle_append(&request);
                self.core.deliver_committed().await;
                response
            }
        }
    }
}
