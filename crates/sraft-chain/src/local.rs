//! # local
//!
//! why: run whole zones inside one process with controllable faults
//! relations: implements the Connector/PeerClient seam of transport.rs; used by tests and simulations
//! what: LocalNetwork (isolation, latency injection), LocalClient

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use sraft_core::{RpcRequest, RpcResponse};
use tokio::time::{sleep, timeout};

use crate::server::{dispatch, RpcHandler};
use crate::transport::{Connector, PeerClient, TransportError};

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
    isolated: HashSet<String>,
    /// one-way delay bounds in milliseconds
    latency: Option<(u64, u64)>,
}

impl NetworkState {
    fn partitioned(&self, a: &str, b: &str) -> bool {
        self.isolated.contains(a) || self.isolated.contains(b)
    }

    fn sample_latency(&self) -> Duration {
        match self.latency {
            Some((low, high)) => Duration::from_millis(rand::thread_rng().gen_range(low..=high)),
            None => Duration::ZERO,
        }
    }
}

/// In-process network connecting handlers by address
#[derive(Clone)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
    call_timeout: Duration,
}

impl LocalNetwork {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            call_timeout,
        }
    }

    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.state.lock().handlers.insert(address.into(), handler);
    }

    pub fn unregister(&self, address: &str) {
        self.state.lock().handlers.remove(address);
    }

    /// Cut `address` off from every other node, in both directions
    pub fn isolate(&self, address: &str) {
        self.state.lock().isolated.insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.state.lock().isolated.remove(address);
    }

    pub fn heal_all(&self) {
        self.state.lock().isolated.clear();
    }

    /// Delay every message by a random amount within `low..=high`
    pub fn set_latency(&self, low: Duration, high: Duration) {
        let low = low.as_millis() as u64;
        let high = (high.as_millis() as u64).max(low);
        self.state.lock().latency = Some((low, high));
    }

    pub fn clear_latency(&self) {
        self.state.lock().latency = None;
    }
}

impl Connector for LocalNetwork {
    fn connect(&self, local: &str, peer: &str) -> Arc<dyn PeerClient> {
        Arc::new(LocalClient {
            local: local.to_string(),
            peer: peer.to_string(),
            network: self.clone(),
        })
    }
}

struct LocalClient {
    local: String,
    peer: String,
    network: LocalNetwork,
}

impl LocalClient {
    fn unreachable(&self, reason: &str) -> TransportError {
        TransportError::PeerUnreachable {
            address: self.peer.clone(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, reason.to_string()),
        }
    }

    /// Handler and one-way delay for the next message, or why there is none
    fn route(&self) -> Result<(Arc<dyn RpcHandler>, Duration), TransportError> {
        let state = self.network.state.lock();
        if state.partitioned(&self.local, &self.peer) {
            return Err(self.unreachable("partitioned"));
        }
        let handler = state
            .handlers
            .get(&self.peer)
            .cloned()
            .ok_or_else(|| self.unreachable("no such node"))?;
        Ok((handler, state.sample_latency()))
    }
}

#[async_trait]
impl PeerClient for LocalClient {
    fn address(&self) -> &str {
        &self.peer
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        let (handler, delay) = self.route()?;

        let exchange = async {
            sleep(delay).await;
            let response = dispatch(handler, request).await;
            let (_, back) = self.route()?;
            sleep(back).await;
            Ok::<_, TransportError>(response)
        };

        timeout(self.network.call_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout {
                address: self.peer.clone(),
                after: self.network.call_timeout,
            })?
    }
}
