//! # replicator
//!
//! why: get each entry onto a majority of the zone without waiting on the slowest follower
//! relations: owns the per-peer clients from transport.rs; reads and updates state only through ChainCore
//! what: Peer, ShardReplicator (quorum wait, one long-lived replication task per follower)

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sraft_core::{LogEntry, ReplicationProgress};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::chain::{ChainCore, CommitCheck};
use crate::error::{ChainError, Result};
use crate::transport::PeerClient;

const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// A zone member other than this node, with its long-lived client
#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) id: String,
    pub(crate) client: Arc<dyn PeerClient>,
}

impl Peer {
    pub(crate) fn new(id: String, client: Arc<dyn PeerClient>) -> Self {
        Self { id, client }
    }
}

/// Result of one append round trip with one follower
enum PeerSync {
    Progress(ReplicationProgress),
    Unreachable,
    NotLeader,
}

pub(crate) struct ShardReplicator {
    peers: Vec<Peer>,
    max_batch_size: usize,
    heartbeat_interval: Duration,
    /// one task per follower, spawned once and kept until stop
    followers: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardReplicator {
    pub(crate) fn new(peers: Vec<Peer>, max_batch_size: usize, heartbeat_interval: Duration) -> Self {
        Self {
            peers,
            max_batch_size,
            heartbeat_interval,
            followers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub(crate) fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Spawn the follower tasks unless they already run. Must run inside a tokio runtime.
    pub(crate) fn spawn_followers(&self, core: &Arc<ChainCore>) {
        let mut followers = self.followers.lock();
        if !followers.is_empty() || core.is_halted() {
            return;
        }
        for peer in &self.peers {
            followers.push(tokio::spawn(Self::run_follower(core.clone(), peer.clone())));
        }
    }

    pub(crate) fn stop_followers(&self) {
        for task in self.followers.lock().drain(..) {
            task.abort();
        }
    }

    /// Wait until `entry` is committed, leadership is lost, or `deadline` passes.
    ///
    /// Sending is left to the follower tasks, which wake when the log grows;
    /// this only watches the commit index, so a minority of slow or dead
    /// followers never holds it up.
    pub(crate) async fn replicate(
        &self,
        core: &Arc<ChainCore>,
        entry: &LogEntry,
        deadline: Instant,
    ) -> Result<()> {
        let started = Instant::now();
        let mut status = core.subscribe();
        self.spawn_followers(core);

        loop {
            match core.commit_state(entry.index, entry.term) {
                CommitCheck::Committed => {
                    debug!(zone = %core.zone_id, index = entry.index, "entry committed");
                    return Ok(());
                }
                CommitCheck::Lost { term } => {
                    warn!(zone = %core.zone_id, index = entry.index, term, "leadership lost while replicating");
                    return Err(ChainError::LeadershipLost { term });
                }
                CommitCheck::Pending => {}
            }

            tokio::select! {
                _ = core.shutdown.cancelled() => return Err(ChainError::Halted),
                changed = timeout_at(deadline, status.changed()) => match changed {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Err(ChainError::Halted),
                    Err(_) => break,
                },
            }
        }

        // the last change may have landed right at the deadline
        if let CommitCheck::Committed = core.commit_state(entry.index, entry.term) {
            return Ok(());
        }
        let waited = started.elapsed();
        warn!(zone = %core.zone_id, index = entry.index, ?waited, "no quorum before deadline");
        Err(ChainError::QuorumUnreachable {
            index: entry.index,
            waited,
        })
    }

    async fn sync_once(core: &ChainCore, peer: &Peer) -> PeerSync {
        let Some((request, term)) = core.build_append(&peer.id) else {
            return PeerSync::NotLeader;
        };
        let sent = request.entries.len();
        match peer.client.append_shard(request).await {
            Ok(response) => {
                trace!(zone = %core.zone_id, peer = %peer.id, sent, success = response.success, "append answered");
                PeerSync::Progress(core.on_append_response(&peer.id, term, &response))
            }
            Err(error) => {
                debug!(zone = %core.zone_id, peer = %peer.id, %error, "append failed");
                PeerSync::Unreachable
            }
        }
    }

    /// Replication loop for one follower, alive until the chain stops.
    ///
    /// While this node leads, the follower is sent an append whenever the
    /// status moves (log growth, commit advance, new leadership) and at least
    /// once per heartbeat interval. An unreachable or rejecting follower is
    /// retried with backoff, and status changes are not acted on meanwhile.
    async fn run_follower(core: Arc<ChainCore>, peer: Peer) {
        let heartbeat = core.replicator.heartbeat_interval;
        let mut status = core.subscribe();
        let mut backoff = RETRY_BACKOFF_MIN;
        let mut backing_off = false;
        let mut next_send = Instant::now();

        loop {
            tokio::select! {
                _ = core.shutdown.cancelled() => break,
                _ = sleep_until(next_send) => {}
                changed = status.changed(), if !backing_off => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if !core.is_leader() {
                backing_off = false;
                backoff = RETRY_BACKOFF_MIN;
                next_send = Instant::now() + heartbeat;
                continue;
            }

            match Self::sync_once(&core, &peer).await {
                PeerSync::Progress(ReplicationProgress::Matched { match_index, .. }) => {
                    backing_off = false;
                    backoff = RETRY_BACKOFF_MIN;
                    // batch limit, more to send
                    next_send = if match_index < core.last_log_index() {
                        Instant::now()
                    } else {
                        Instant::now() + heartbeat
                    };
                }
                PeerSync::Progress(ReplicationProgress::Rejected { .. }) => {
                    // reachable, next index already moved back
                    backing_off = true;
                    backoff = RETRY_BACKOFF_MIN;
                    next_send = Instant::now() + backoff;
                }
                PeerSync::Unreachable => {
                    backing_off = true;
                    next_send = Instant::now() + backoff;
                    backoff = (backoff * 2).min(heartbeat);
                }
                PeerSync::Progress(ReplicationProgress::StaleTerm { .. })
                | PeerSync::Progress(ReplicationProgress::Ignored)
                | PeerSync::NotLeader => {
                    backing_off = false;
                    next_send = Instant::now() + heartbeat;
                }
            }
        }
        trace!(zone = %core.zone_id, peer = %peer.id, "follower replication stopped");
    }

    /// One append to every follower, concurrently
    pub(crate) async fn broadcast(&self, core: &ChainCore) {
        futures::future::join_all(self.peers.iter().map(|peer| Self::sync_once(core, peer))).await;
    }
}
