//! # comprehensive chain tests
//!
//! why: exercise whole zones end to end over the in-process network
//! relations: tests sraft-chain (with sraft-core and sraft-storage underneath)
//! what: ordering, partitions, leadership loss, election safety, log matching,
//!       exactly-once delivery, restart recovery

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sraft_chain::{
    Chain, ChainError, ChainOptions, ChainSupport, Config, LocalNetwork, MemoryLedger, NodeState,
    RpcHandler,
};
use sraft_core::{AppendShardResponse, RpcRequest, RpcResponse, VoteResponse, ZoneConfig};
use sraft_storage::{FileStorage, InMemoryStorage, Storage};
use tokio::time::{sleep, Instant};
use tracing_subscriber::{fmt, EnvFilter};

const ZONE: &str = "z1";

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sraft_chain=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn config(nodes: &[String]) -> Arc<Config> {
    let zone = ZoneConfig::new(1, nodes.to_vec());
    let config = Config::new(
        Duration::from_millis(150),
        Duration::from_millis(50),
        16,
        [(ZONE.to_string(), zone)],
    )
    .unwrap();
    Arc::new(config.with_timeouts(Duration::from_millis(100), Duration::from_secs(2)).unwrap())
}

async fn eventually(what: &str, limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Order through whichever node leads, retrying across elections
async fn order_anywhere(cluster: &Cluster, payload: &[u8]) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(leader) = cluster.leader() {
            let attempt = cluster.chains[leader]
                .order_with_timeout(payload.to_vec(), 0, Duration::from_millis(500))
                .await;
            if let Ok(index) = attempt {
                return index;
            }
        }
        assert!(Instant::now() < deadline, "no leader accepted {payload:?}");
        sleep(Duration::from_millis(20)).await;
    }
}

fn payloads(ledger: &MemoryLedger) -> Vec<Vec<u8>> {
    ledger.entries().into_iter().map(|e| e.payload).collect()
}

struct Cluster {
    network: LocalNetwork,
    nodes: Vec<String>,
    chains: Vec<Arc<Chain>>,
    ledgers: Vec<Arc<MemoryLedger>>,
}

impl Cluster {
    fn new(size: usize) -> Self {
        init_tracing();
        let nodes: Vec<String> = (0..size).map(|i| format!("n{i}:7050")).collect();
        let config = config(&nodes);
        let network = LocalNetwork::new(config.rpc_timeout());

        let mut chains = Vec::new();
        let mut ledgers = Vec::new();
        for node in &nodes {
            let ledger = Arc::new(MemoryLedger::new());
            let chain = Chain::new(
                ChainOptions::new(node.clone(), ZONE),
                config.clone(),
                ledger.clone(),
                Box::new(InMemoryStorage::new()),
                &network,
            )
            .ok()
            .unwrap();
            network.register(node.clone(), chain.clone());
            chains.push(chain);
            ledgers.push(ledger);
        }

        Self {
            network,
            nodes,
            chains,
            ledgers,
        }
    }

    fn start(&self) {
        for chain in &self.chains {
            chain.start().unwrap();
        }
    }

    /// Index of the leader with the highest term, if any
    fn leader(&self) -> Option<usize> {
        self.chains
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_leader())
            .max_by_key(|(_, c)| c.status().term)
            .map(|(i, _)| i)
    }

    async fn elect(&self, i: usize) {
        assert!(self.chains[i].campaign().await.unwrap(), "node {i} lost its election");
    }

    fn stop(&self) {
        for chain in &self.chains {
            chain.stop();
        }
    }
}

// =============================================================================
// SECTION 1: ORDERING THROUGH THE LEADER
// =============================================================================

mod ordering {
    use super::*;

    #[tokio::test]
    async fn leader_orders_first_entry_at_index_one() {
        let cluster = Cluster::new(3);
        cluster.start();
        cluster.elect(0).await;

        let index = cluster.chains[0].order(b"tx1".to_vec(), 0).await.unwrap();

        assert_eq!(index, 1);
        assert_eq!(cluster.chains[0].status().commit_index, 1);
        assert_eq!(payloads(&cluster.ledgers[0]), vec![b"tx1".to_vec()]);
        cluster.stop();
    }

    #[tokio::test]
    async fn followers_deliver_what_the_leader_committed() {
        let cluster = Cluster::new(3);
        cluster.start();
        cluster.elect(0).await;

        for i in 0..5u8 {
            cluster.chains[0].order(vec![i], 0).await.unwrap();
        }

        eventually("followers to deliver", Duration::from_secs(2), || {
            cluster.ledgers.iter().all(|l| l.height() == 5)
        })
        .await;
        let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i]).collect();
        for ledger in &cluster.ledgers {
            assert_eq!(payloads(ledger), expected);
        }
        cluster.stop();
    }

    #[tokio::test]
    async fn follower_rejects_order_and_names_leader() {
        let cluster = Cluster::new(3);
        cluster.start();
        cluster.elect(0).await;
        let before = cluster.chains[1].entries().len();

        let err = cluster.chains[1].order(b"tx".to_vec(), 0).await.unwrap_err();

        match err {
            ChainError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("n0:7050")),
            other => panic!("expected NotLeader, got {other:?}"),
        }
        assert_eq!(cluster.chains[1].entries().len(), before);
        cluster.stop();
    }

    #[tokio::test]
    async fn concurrent_orders_get_distinct_contiguous_indices() {
        let cluster = Cluster::new(3);
        cluster.start();
        cluster.elect(0).await;

        let leader = cluster.chains[0].clone();
        let tasks: Vec<_> = (0..10u8)
            .map(|i| {
                let leader = leader.clone();
                tokio::spawn(async move { leader.order(vec![i], 0).await })
            })
            .collect();

        let mut indices = Vec::new();
        for task in tasks {
            indices.push(task.await.unwrap().unwrap());
        }
        indices.sort_unstable();

        assert_eq!(indices, (1..=10).collect::<Vec<u64>>());
        cluster.stop();
    }

    #[tokio::test]
    async fn stale_config_sequence_is_still_ordered() {
        let cluster = Cluster::new(3);
        for ledger in &cluster.ledgers {
            ledger.set_sequence(7);
        }
        cluster.start();
        cluster.elect(0).await;

        let index = cluster.chains[0].order(b"old".to_vec(), 3).await.unwrap();

        assert_eq!(index, 1);
        assert_eq!(cluster.ledgers[0].entries()[0].config_seq, 3);
        cluster.stop();
    }
}

// =============================================================================
// SECTION 2: PARTITIONS AND QUORUM
// =============================================================================

mod partitions {
    use super::*;

    #[tokio::test]
    async fn one_unreachable_follower_does_not_block_commit() {
        let cluster = Cluster::new(3);
        cluster.start();
        cluster.elect(0).await;
        cluster.network.isolate(&cluster.nodes[2]);

        let started = Instant::now();
        let index = cluster.chains[0].order(b"tx".to_vec(), 0).await.unwrap();

        assert_eq!(index, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        cluster.stop();
    }

    #[tokio::test]
    async fn losing_the_majority_fails_within_the_timeout() {
        let cluster = Cluster::new(3);
        cluster.start();
        cluster.elect(0).await;
        cluster.network.isolate(&cluster.nodes[1]);
        cluster.network.isolate(&cluster.nodes[2]);

        let started = Instant::now();
        let err = cluster.chains[0]
            .order_with_timeout(b"tx".to_vec(), 0, Duration::from_millis(300))
            .await
            .unwrap_err();

        match err {
            ChainError::QuorumUnreachable { index, waited } => {
                assert_eq!(index, 1);
                assert!(waited >= Duration::from_millis(250));
            }
            other => panic!("expected QuorumUnreachable, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(cluster.ledgers[0].entries().is_empty());
        cluster.stop();
    }

    /// Refuses everything and counts the appends it is sent
    #[derive(Default)]
    struct DownPeer {
        appends: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for DownPeer {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            if let RpcRequest::AppendShard(_) = request {
                self.appends.fetch_add(1, Ordering::SeqCst);
            }
            RpcResponse::Error("down".to_string())
        }
    }

    #[tokio::test]
    async fn dead_follower_gets_one_retry_loop_not_one_per_order() {
        let cluster = Cluster::new(3);
        let down = Arc::new(DownPeer::default());
        cluster.chains[2].stop();
        cluster.network.register(cluster.nodes[2].clone(), down.clone());
        cluster.chains[0].start().unwrap();
        cluster.chains[1].start().unwrap();
        cluster.elect(0).await;

        let started = Instant::now();
        let orders: Vec<_> = (0..50u8)
            .map(|i| {
                let leader = cluster.chains[0].clone();
                tokio::spawn(async move { leader.order(vec![i], 0).await })
            })
            .collect();
        for order in orders {
            order.await.unwrap().unwrap();
        }
        sleep(Duration::from_millis(300)).await;

        // one task backing off towards the heartbeat interval, whatever the order count
        let heartbeat = config(&cluster.nodes).heartbeat_interval();
        let budget = (started.elapsed().as_millis() / heartbeat.as_millis()) as usize + 10;
        let appends = down.appends.load(Ordering::SeqCst);
        assert!(appends <= budget, "{appends} appends to a dead follower, budget {budget}");
        cluster.stop();
    }

    #[tokio::test]
    async fn lagging_follower_catches_up_after_heal() {
        let cluster = Cluster::new(3);
        cluster.start();
        cluster.elect(0).await;
        cluster.network.isolate(&cluster.nodes[2]);

        for i in 0..20u8 {
            cluster.chains[0].order(vec![i], 0).await.unwrap();
        }
        cluster.network.heal_all();
        // entries of an older term commit only behind one from the current term
        order_anywhere(&cluster, b"flush").await;

        eventually("lagging follower to catch up", Duration::from_secs(3), || {
            let leader = cluster.leader().unwrap_or(0);
            let height = cluster.ledgers[leader].height();
            height >= 21 && cluster.ledgers[2].height() == height
        })
        .await;
        let delivered = payloads(&cluster.ledgers[2]);
        let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
        assert_eq!(delivered[..20], expected[..]);
        assert_eq!(delivered, payloads(&cluster.ledgers[cluster.leader().unwrap_or(0)]));
        cluster.stop();
    }
}

// =============================================================================
// SECTION 3: LEADERSHIP LOSS
// =============================================================================

mod leadership_loss {
    use super::*;

    /// Grants votes and accepts heartbeats, but answers any append that
    /// carries entries with a newer term
    struct NewerTermPeer {
        term: u64,
    }

    #[async_trait]
    impl RpcHandler for NewerTermPeer {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::Vote(req) => RpcResponse::Vote(VoteResponse {
                    vote_granted: true,
                    term: req.term,
                }),
                RpcRequest::AppendShard(req) if req.entries.is_empty() => {
                    RpcResponse::AppendShard(AppendShardResponse {
                        success: true,
                        term: req.term,
                        match_index: req.prev_log_index,
                    })
                }
                RpcRequest::AppendShard(_) => RpcResponse::AppendShard(AppendShardResponse {
                    success: false,
                    term: self.term,
                    match_index: 0,
                }),
            }
        }
    }

    #[tokio::test]
    async fn higher_term_response_fails_order_and_steps_down() {
        init_tracing();
        let nodes: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let network = LocalNetwork::new(Duration::from_millis(100));
        network.register("b", Arc::new(NewerTermPeer { term: 3 }));

        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(1, None).unwrap();
        let chain = Chain::new(
            ChainOptions::new("a", ZONE),
            config(&nodes),
            Arc::new(MemoryLedger::new()),
            Box::new(storage),
            &network,
        )
        .ok()
        .unwrap();

        assert!(chain.campaign().await.unwrap());
        assert_eq!(chain.status().term, 2);

        let err = chain.order(b"tx".to_vec(), 0).await.unwrap_err();

        assert!(matches!(err, ChainError::LeadershipLost { term: 3 }));
        let status = chain.status();
        assert_eq!(status.term, 3);
        assert_eq!(status.role, NodeState::Follower);
    }

    #[tokio::test]
    async fn isolated_leader_is_replaced() {
        let cluster = Cluster::new(3);
        cluster.start();
        cluster.elect(0).await;
        cluster.chains[0].order(b"before".to_vec(), 0).await.unwrap();

        cluster.network.isolate(&cluster.nodes[0]);
        eventually("a new leader", Duration::from_secs(3), || {
            cluster.chains[1..].iter().any(|c| c.is_leader())
        })
        .await;
        order_anywhere(&cluster, b"after").await;

        cluster.network.heal_all();
        eventually("old leader to rejoin", Duration::from_secs(3), || {
            let leader = cluster.leader().unwrap_or(1);
            leader != 0 && cluster.ledgers[0].height() >= 2
                && cluster.ledgers[0].height() == cluster.ledgers[leader].height()
        })
        .await;
        let delivered = payloads(&cluster.ledgers[0]);
        assert_eq!(delivered[0], b"before".to_vec());
        assert_eq!(delivered[1], b"after".to_vec());
        cluster.stop();
    }
}

// =============================================================================
// SECTION 4: ELECTION SAFETY
// =============================================================================

mod election_safety {
    use super::*;

    #[tokio::test]
    async fn at_most_one_leader_per_term_under_churn() {
        let cluster = Cluster::new(5);
        cluster
            .network
            .set_latency(Duration::from_millis(0), Duration::from_millis(20));

        let mut watchers = Vec::new();
        for chain in &cluster.chains {
            let mut status = chain.subscribe();
            let node = chain.node_id().to_string();
            watchers.push(tokio::spawn(async move {
                let mut terms = Vec::new();
                let _ = tokio::time::timeout(Duration::from_secs(3), async {
                    loop {
                        {
                            let current = status.borrow_and_update();
                            if current.role == NodeState::Leader {
                                terms.push(current.term);
                            }
                        }
                        if status.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
                (node, terms)
            }));
        }

        cluster.start();
        for _ in 0..3 {
            eventually("a leader", Duration::from_secs(2), || cluster.leader().is_some()).await;
            let leader = cluster.leader().unwrap();
            cluster.network.isolate(&cluster.nodes[leader]);
            sleep(Duration::from_millis(500)).await;
            cluster.network.heal_all();
        }

        let mut leaders_by_term: HashMap<u64, String> = HashMap::new();
        for watcher in watchers {
            let (node, terms) = watcher.await.unwrap();
            for term in terms {
                let previous = leaders_by_term.entry(term).or_insert_with(|| node.clone());
                assert_eq!(*previous, node, "two leaders in term {term}");
            }
        }
        assert!(leaders_by_term.len() >= 2);
        cluster.stop();
    }

    #[tokio::test]
    async fn timers_elect_a_leader_without_help() {
        let cluster = Cluster::new(3);
        cluster.start();

        eventually("a leader", Duration::from_secs(2), || cluster.leader().is_some()).await;
        let leader = cluster.leader().unwrap();
        let term = cluster.chains[leader].status().term;

        eventually("followers to learn the leader", Duration::from_secs(1), || {
            cluster.chains.iter().all(|c| {
                let status = c.status();
                status.term == term && status.leader.as_deref() == Some(cluster.nodes[leader].as_str())
            })
        })
        .await;
        cluster.stop();
    }
}

// =============================================================================
// SECTION 5: LOG MATCHING AND DELIVERY
// =============================================================================

mod delivery {
    use super::*;

    #[tokio::test]
    async fn logs_match_across_the_zone() {
        let cluster = Cluster::new(5);
        cluster.start();
        cluster.elect(0).await;

        for i in 0..12u8 {
            cluster.chains[0].order(vec![i], 0).await.unwrap();
        }

        eventually("all logs to converge", Duration::from_secs(3), || {
            cluster.chains.iter().all(|c| c.entries().len() == 12)
        })
        .await;
        let reference = cluster.chains[0].entries();
        for chain in &cluster.chains[1..] {
            assert_eq!(chain.entries(), reference);
        }
        for (i, entry) in reference.iter().enumerate() {
            assert_eq!(entry.index, i as u64 + 1);
        }
        cluster.stop();
    }

    #[tokio::test]
    async fn ledger_failures_are_retried_without_duplicates() {
        let cluster = Cluster::new(3);
        cluster.ledgers[1].fail_next(3);
        cluster.start();
        cluster.elect(0).await;

        for i in 0..4u8 {
            cluster.chains[0].order(vec![i], 0).await.unwrap();
        }

        eventually("follower ledger to recover", Duration::from_secs(3), || {
            cluster.ledgers[1].height() == 4
        })
        .await;
        // MemoryLedger refuses gaps and repeats, so a height of 4 means each entry landed once
        assert_eq!(payloads(&cluster.ledgers[1]), payloads(&cluster.ledgers[0]));
        cluster.stop();
    }

    #[tokio::test]
    async fn leader_ledger_failure_does_not_fail_the_order() {
        let cluster = Cluster::new(3);
        cluster.ledgers[0].fail_next(1);
        cluster.start();
        cluster.elect(0).await;

        assert_eq!(cluster.chains[0].order(b"tx".to_vec(), 0).await.unwrap(), 1);

        eventually("retry on the leader", Duration::from_secs(2), || {
            cluster.ledgers[0].height() == 1
        })
        .await;
        cluster.stop();
    }
}

// =============================================================================
// SECTION 6: RESTART RECOVERY
// =============================================================================

mod recovery {
    use super::*;

    fn solo(dir: &std::path::Path, ledger: Arc<MemoryLedger>) -> Arc<Chain> {
        let nodes = vec!["solo:7050".to_string()];
        let network = LocalNetwork::new(Duration::from_millis(100));
        Chain::new(
            ChainOptions::new("solo:7050", ZONE),
            config(&nodes),
            ledger,
            Box::new(FileStorage::new(dir).unwrap()),
            &network,
        )
        .ok()
        .unwrap()
    }

    #[tokio::test]
    async fn restart_resumes_without_redelivery() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());

        let first_term = {
            let chain = solo(dir.path(), ledger.clone());
            chain.campaign().await.unwrap();
            chain.order(b"tx1".to_vec(), 0).await.unwrap();
            chain.order(b"tx2".to_vec(), 0).await.unwrap();
            let term = chain.status().term;
            chain.stop();
            term
        };

        let chain = solo(dir.path(), ledger.clone());
        let status = chain.status();
        assert_eq!(status.term, first_term);
        assert_eq!(status.last_index, 2);
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.role, NodeState::Follower);

        chain.campaign().await.unwrap();
        assert_eq!(chain.status().term, first_term + 1);
        assert_eq!(chain.order(b"tx3".to_vec(), 0).await.unwrap(), 3);
        assert_eq!(
            payloads(&ledger),
            vec![b"tx1".to_vec(), b"tx2".to_vec(), b"tx3".to_vec()]
        );
    }

    #[tokio::test]
    async fn vote_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(4, Some("other:7050")).unwrap();
        }

        let chain = solo(dir.path(), Arc::new(MemoryLedger::new()));

        assert_eq!(chain.status().term, 4);
        // a new election moves past the persisted term
        chain.campaign().await.unwrap();
        assert_eq!(chain.status().term, 5);
    }
}
