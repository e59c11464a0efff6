//! # election
//!
//! why: elect one leader per zone and term, and replace it when it goes quiet
//! relations: reads and updates state through ChainCore; solicits votes over the replicator's peers
//! what: ElectionManager (randomized timeouts, election timer loop, concurrent vote solicitation)

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use sraft_core::VoteOutcome;
use tokio::time::sleep_until;
use tracing::{debug, trace};

use crate::chain::{CampaignStart, ChainCore, ElectionTick};

pub(crate) struct ElectionManager {
    base_timeout: Duration,
}

impl ElectionManager {
    pub(crate) fn new(base_timeout: Duration) -> Self {
        Self { base_timeout }
    }

    /// Base timeout plus a random jitter of up to one more base timeout
    pub(crate) fn next_timeout(&self) -> Duration {
        let base = self.base_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base);
        self.base_timeout + Duration::from_millis(jitter)
    }

    /// Timer loop: campaign whenever the deadline passes without word from a leader
    pub(crate) async fn run(core: Arc<ChainCore>) {
        loop {
            match core.poll_election() {
                ElectionTick::Due => {
                    tokio::select! {
                        _ = core.shutdown.cancelled() => break,
                        _ = core.election.campaign(&core) => {}
                    }
                }
                ElectionTick::Wait(deadline) => {
                    tokio::select! {
                        _ = core.shutdown.cancelled() => break,
                        _ = sleep_until(deadline) => {}
                    }
                }
            }
        }
        trace!(zone = %core.zone_id, node = %core.node_id, "election timer stopped");
    }

    /// Run one election. Votes are requested from every peer at once and
    /// counted as they arrive; the first majority wins without waiting for
    /// the rest. Returns whether this node leads afterwards.
    pub(crate) async fn campaign(&self, core: &Arc<ChainCore>) -> bool {
        let request = match core.begin_campaign() {
            CampaignStart::Won => {
                core.replicator.broadcast(core).await;
                return true;
            }
            CampaignStart::Aborted => return false,
            CampaignStart::Solicit(request) => request,
        };
        let term = request.term;

        let mut ballots: FuturesUnordered<_> = core
            .replicator
            .peers()
            .iter()
            .map(|peer| {
                let request = request.clone();
                async move { (peer.id.as_str(), peer.client.request_vote(request).await) }
            })
            .collect();

        while let Some((peer, result)) = ballots.next().await {
            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    debug!(zone = %core.zone_id, term, peer, %error, "vote request failed");
                    continue;
                }
            };

            match core.on_vote_response(peer, &response) {
                VoteOutcome::Won => {
                    core.replicator.broadcast(core).await;
                    return true;
                }
                VoteOutcome::StaleTerm { .. } => return false,
                VoteOutcome::Pending => {}
                VoteOutcome::Ignored => {
                    if !core.is_candidate_in(term) {
                        return false;
                    }
                }
            }
        }

        debug!(zone = %core.zone_id, term, "election ended without a majority");
        false
    }
}
