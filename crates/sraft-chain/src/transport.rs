//! # transport
//!
//! why: carry AppendShard and Vote calls to zone peers, each call timeboxed
//! relations: used by replicator.rs and election.rs; server.rs is the receiving end
//! what: PeerClient and Connector traits, TransportError, pooled TCP ReplicationTransport

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sraft_core::{
    AppendShardRequest, AppendShardResponse, RpcFrame, RpcRequest, RpcResponse, VoteRequest,
    VoteResponse,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace};

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;
const INITIAL_DIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_DIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Why a single remote call produced no response
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {address} unreachable: {source}")]
    PeerUnreachable {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("call to {address} timed out after {after:?}")]
    Timeout { address: String, after: Duration },

    #[error("connection to {address} closed")]
    Closed { address: String },

    #[error("connection failure: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("peer refused the request: {0}")]
    Remote(String),

    #[error("peer answered with the wrong response kind")]
    UnexpectedResponse,
}

/// Client side of one zone peer
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Address of the peer this client talks to
    fn address(&self) -> &str;

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TransportError>;

    async fn append_shard(
        &self,
        request: AppendShardRequest,
    ) -> Result<AppendShardResponse, TransportError> {
        match self.call(RpcRequest::AppendShard(request)).await? {
            RpcResponse::AppendShard(response) => Ok(response),
            RpcResponse::Error(reason) => Err(TransportError::Remote(reason)),
            RpcResponse::Vote(_) => Err(TransportError::UnexpectedResponse),
        }
    }

    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse, TransportError> {
        match self.call(RpcRequest::Vote(request)).await? {
            RpcResponse::Vote(response) => Ok(response),
            RpcResponse::Error(reason) => Err(TransportError::Remote(reason)),
            RpcResponse::AppendShard(_) => Err(TransportError::UnexpectedResponse),
        }
    }
}

/// Hands out one reusable client per peer address
pub trait Connector: Send + Sync {
    fn connect(&self, local: &str, peer: &str) -> Arc<dyn PeerClient>;
}

pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// TCP client for one peer.
///
/// The connection is dialled on first use and kept for later calls; any
/// failure drops it so the next call dials again. Calls on one client are
/// serialized, calls to different peers run independently.
pub struct ReplicationTransport {
    address: String,
    call_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl ReplicationTransport {
    pub fn new(address: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            call_timeout,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn timed_out(&self) -> TransportError {
        TransportError::Timeout {
            address: self.address.clone(),
            after: self.call_timeout,
        }
    }

    /// Dial with exponential backoff until `deadline`
    async fn dial(&self, deadline: Instant) -> Result<Connection, TransportError> {
        let mut backoff = INITIAL_DIAL_BACKOFF;
        loop {
            let error = match timeout_at(deadline, TcpStream::connect(self.address.as_str())).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    debug!(peer = %self.address, "connected");
                    return Ok(Framed::new(stream, frame_codec()));
                }
                Ok(Err(error)) => error,
                Err(_) => return Err(self.timed_out()),
            };

            if Instant::now() + backoff >= deadline {
                return Err(TransportError::PeerUnreachable {
                    address: self.address.clone(),
                    source: error,
                });
            }
            trace!(peer = %self.address, %error, ?backoff, "dial failed, retrying");
            sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_DIAL_BACKOFF);
        }
    }

    async fn round_trip(
        connection: &mut Connection,
        id: u64,
        frame: Bytes,
    ) -> Result<Option<RpcResponse>, TransportError> {
        connection.send(frame).await?;
        while let Some(bytes) = connection.next().await {
            let reply: RpcFrame<RpcResponse> = serde_json::from_slice(&bytes?)?;
            if reply.id == id {
                return Ok(Some(reply.body));
            }
            // answer to a call that already gave up
            trace!(expected = id, got = reply.id, "skipping stale response");
        }
        Ok(None)
    }
}

#[async_trait]
impl PeerClient for ReplicationTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        let deadline = Instant::now() + self.call_timeout;
        let mut slot = timeout_at(deadline, self.connection.lock())
            .await
            .map_err(|_| self.timed_out())?;

        if slot.is_none() {
            *slot = Some(self.dial(deadline).await?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(TransportError::Closed {
                address: self.address.clone(),
            });
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Bytes::from(serde_json::to_vec(&RpcFrame { id, body: request })?);

        let result = match timeout_at(deadline, Self::round_trip(connection, id, frame)).await {
            Ok(Ok(Some(response))) => return Ok(response),
            Ok(Ok(None)) => Err(TransportError::Closed {
                address: self.address.clone(),
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(self.timed_out()),
        };
        *slot = None;
        result
    }
}

/// Builds [`ReplicationTransport`] clients
#[derive(Debug, Clone)]
pub struct TcpConnector {
    call_timeout: Duration,
}

impl TcpConnector {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, _local: &str, peer: &str) -> Arc<dyn PeerClient> {
        Arc::new(ReplicationTransport::new(peer, self.call_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote() -> RpcRequest {
        RpcRequest::Vote(VoteRequest {
            term: 1,
            candidate_id: "a".into(),
            zone_id: "z".into(),
            last_log_index: 0,
            last_log_term: 0,
        })
    }

    #[tokio::test]
    async fn unreachable_peer_fails_within_budget() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = ReplicationTransport::new(address, Duration::from_millis(50));
        let started = std::time::Instant::now();
        let err = transport.call(vote()).await.unwrap_err();

        assert!(matches!(
            err,
            TransportError::PeerUnreachable { .. } | TransportError::Timeout { .. }
        ));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        // accept but never answer
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(5)).await;
        });

        let transport = ReplicationTransport::new(address, Duration::from_millis(50));
        let err = transport.call(vote()).await.unwrap_err();

        assert!(matches!(err, TransportError::Timeout { .. }));
    }
}
