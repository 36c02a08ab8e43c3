//! Inbound side of a link: bind once, accept forever, one task per peer.

use super::{read_frame, LinkError};
use crate::config::Endpoint;
use crate::logging::LogContext;
use crate::state::{new_shared, Shared};
use farm_protocol::Envelope;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reception callback. Liveness probes never reach it.
pub trait EnvelopeHandler: Send + Sync + 'static {
    fn handle(&self, envelope: Envelope, peer: SocketAddr) -> BoxFuture<'_, ()>;
}

/// Live connection handlers, pruned as peers go away.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    live: Shared<HashMap<u64, SocketAddr>>,
}

impl ConnectionSet {
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.live.lock().values().copied().collect()
    }
}

pub struct LinkServer {
    listener: TcpListener,
    read_timeout: Duration,
    connections: ConnectionSet,
    log: LogContext,
}

impl LinkServer {
    pub async fn bind(endpoint: &Endpoint, read_timeout: Duration, log: LogContext) -> Result<Self, LinkError> {
        let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| LinkError::Bind { endpoint: endpoint.clone(), source })?;
        info!(parent: log.span(), %endpoint, "link server listening");
        Ok(Self {
            listener,
            read_timeout,
            connections: ConnectionSet { live: new_shared(HashMap::new()) },
            log,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn connections(&self) -> ConnectionSet {
        self.connections.clone()
    }

    pub fn spawn(self, handler: Arc<dyn EnvelopeHandler>, cancel: CancellationToken) -> JoinHandle<()> {
        let log = self.log.clone();
        tokio::spawn(log.in_span(self.run(handler, cancel)))
    }

    /// Accept loop. Returns only on cancellation.
    pub async fn run(self, handler: Arc<dyn EnvelopeHandler>, cancel: CancellationToken) {
        let mut next_id: u64 = 0;
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.listener.accept() => res,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            next_id += 1;
            let id = next_id;
            self.connections.live.lock().insert(id, peer);
            info!(%peer, total = self.connections.len(), "peer connected");

            let connections = self.connections.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            let read_timeout = self.read_timeout;
            let task = async move {
                serve_peer(stream, peer, handler, read_timeout, cancel).await;
                connections.live.lock().remove(&id);
                info!(%peer, total = connections.len(), "peer handler pruned");
            };
            tokio::spawn(self.log.in_span(task));
        }
        info!("link server stopped");
    }
}

async fn serve_peer(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn EnvelopeHandler>,
    read_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            res = tokio::time::timeout(read_timeout, read_frame(&mut stream)) => res,
        };

        let body = match read {
            Ok(Ok(body)) => body,
            Ok(Err(LinkError::Closed)) => {
                info!(%peer, "peer disconnected");
                return;
            }
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "link read failed");
                return;
            }
            Err(_) => {
                warn!(%peer, error = %LinkError::Timeout(read_timeout), "silent peer dropped");
                return;
            }
        };

        match Envelope::from_json(&body) {
            Ok(Envelope::CheckMessage) => debug!(%peer, "check_message received"),
            Ok(envelope) => {
                debug!(%peer, kind = envelope.kind(), "envelope received");
                handler.handle(envelope, peer).await;
            }
            Err(e) => warn!(
                %peer,
                error = %e,
                raw = %String::from_utf8_lossy(&body),
                "envelope rejected"
            ),
        }
    }
}
