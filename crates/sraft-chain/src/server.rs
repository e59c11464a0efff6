//! # server
//!
//! why: accept peer calls over TCP and hand each one to the chain of its zone
//! relations: speaks the framing of transport.rs; Chain and ZoneRouter implement RpcHandler
//! what: RpcHandler trait, RpcServer, ZoneRouter, panic-isolated dispatch

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use sraft_core::{RpcFrame, RpcRequest, RpcResponse};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::transport::frame_codec;

/// Receiving end of peer calls
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

/// Run one request in its own task so a panicking handler only fails that request
pub(crate) async fn dispatch(handler: Arc<dyn RpcHandler>, request: RpcRequest) -> RpcResponse {
    match tokio::spawn(async move { handler.handle(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(error = %join_error, "rpc handler failed");
            RpcResponse::Error(format!("handler failed: {join_error}"))
        }
    }
}

/// Multiplexes the chains of several zones behind one address
#[derive(Default)]
pub struct ZoneRouter {
    zones: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl ZoneRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, zone_id: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.zones.write().insert(zone_id.into(), handler);
    }

    pub fn remove(&self, zone_id: &str) -> Option<Arc<dyn RpcHandler>> {
        self.zones.write().remove(zone_id)
    }

    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self.zones.read().keys().cloned().collect();
        zones.sort();
        zones
    }
}

#[async_trait]
impl RpcHandler for ZoneRouter {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let handler = self.zones.read().get(request.zone_id()).cloned();
        match handler {
            Some(handler) => handler.handle(request).await,
            None => RpcResponse::Error(format!("unknown zone {}", request.zone_id())),
        }
    }
}

/// TCP listener serving peer calls until shut down
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl RpcServer {
    pub async fn bind(addr: impl ToSocketAddrs, handler: Arc<dyn RpcHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, handler, shutdown.clone()));
        info!(%local_addr, "rpc server listening");

        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close open connections
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.accept_task.is_finished()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn RpcHandler>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, handler.clone(), shutdown.child_token()));
                }
                Err(error) => warn!(%error, "accept failed"),
            },
        }
    }
    debug!("rpc server stopped accepting");
}

#[instrument(skip_all, fields(%peer))]
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%error, "set_nodelay failed");
    }
    let (mut writer, mut reader) = Framed::new(stream, frame_codec()).split();
    let (replies, mut outgoing) = mpsc::channel::<RpcFrame<RpcResponse>>(64);

    let write_task = tokio::spawn(async move {
        while let Some(reply) = outgoing.recv().await {
            let bytes = match serde_json::to_vec(&reply) {
                Ok(bytes) => bytes,
                Err(error) => {
                    error!(%error, "failed to encode response");
                    continue;
                }
            };
            if writer.send(Bytes::from(bytes)).await.is_err() {
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reader.next() => next,
        };
        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(error)) => {
                debug!(%error, "connection read failed");
                break;
            }
            None => break,
        };
        let frame: RpcFrame<RpcRequest> = match serde_json::from_slice(&bytes) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "malformed request frame, closing connection");
                break;
            }
        };

        let handler = handler.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let body = dispatch(handler, frame.body).await;
            // peer may be gone already
            let _ = replies.send(RpcFrame { id: frame.id, body }).await;
        });
    }

    drop(replies);
    if shutdown.is_cancelled() {
        write_task.abort();
    }
    debug!("connection closed");
}
