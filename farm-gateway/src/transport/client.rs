//! Outbound side of a link.
//!
//! [`LinkClient`] owns one TCP stream. Connecting is a blocking retry loop on
//! a fixed delay. A send on a link that is not connected, or that fails half
//! way, marks the link `Lost`, runs the retry loop until the peer is back and
//! only then reports the failure: the link heals on the next send.
//!
//! [`Outbox`] puts a bounded queue and a forwarding task in front of a client
//! so that producers never wait on a dead peer.

use super::{write_envelope, ConnectionState, LinkError};
use crate::config::Endpoint;
use crate::logging::LogContext;
use farm_protocol::Envelope;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct LinkClient {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Endpoint,
    retry_delay: Duration,
    stream: Mutex<Option<TcpStream>>,
    state: watch::Sender<ConnectionState>,
    reconnects: AtomicU32,
    cancel: CancellationToken,
    log: LogContext,
}

impl LinkClient {
    pub fn new(endpoint: Endpoint, retry_delay: Duration, cancel: CancellationToken, log: LogContext) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                retry_delay,
                stream: Mutex::new(None),
                state,
                reconnects: AtomicU32::new(0),
                cancel,
                log,
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of times the link was lost after being up.
    pub fn reconnects(&self) -> u32 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    /// Resolves once the link is `Connected`, or when it is shut down.
    pub async fn wait_connected(&self) {
        let mut rx = self.subscribe();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {}
            _ = rx.wait_for(|state| *state == ConnectionState::Connected) => {}
        }
    }

    /// Retries until connected. Only cancellation ends the loop early.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let mut slot = self.inner.stream.lock().await;
        if slot.is_some() && self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.connect_locked(&mut slot).await
    }

    async fn connect_locked(&self, slot: &mut Option<TcpStream>) -> Result<(), LinkError> {
        let endpoint = &self.inner.endpoint;
        let fallback = match self.state() {
            ConnectionState::Lost => ConnectionState::Lost,
            _ => ConnectionState::Disconnected,
        };

        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(LinkError::Cancelled);
                }
                res = TcpStream::connect((endpoint.host.as_str(), endpoint.port)) => res,
            };

            match attempt {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(parent: self.inner.log.span(), error = %e, "set_nodelay failed");
                    }
                    *slot = Some(stream);
                    self.set_state(ConnectionState::Connected);
                    info!(parent: self.inner.log.span(), %endpoint, "link connected");
                    return Ok(());
                }
                Err(e) => {
                    self.set_state(fallback);
                    warn!(
                        parent: self.inner.log.span(),
                        %endpoint,
                        error = %e,
                        retry_in = ?self.inner.retry_delay,
                        "link connection failed"
                    );
                }
            }

            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(LinkError::Cancelled);
                }
                _ = tokio::time::sleep(self.inner.retry_delay) => {}
            }
        }
    }

    /// Sends one envelope. On failure the link is re-established before the
    /// error is returned.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), LinkError> {
        let mut slot = self.inner.stream.lock().await;

        let failure = match slot.as_mut() {
            Some(stream) if self.state() == ConnectionState::Connected => {
                match write_envelope(stream, envelope).await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            _ => LinkError::NotConnected(self.inner.endpoint.clone()),
        };

        warn!(
            parent: self.inner.log.span(),
            endpoint = %self.inner.endpoint,
            kind = envelope.kind(),
            error = %failure,
            "link lost, reconnecting"
        );
        *slot = None;
        self.set_state(ConnectionState::Lost);
        self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
        self.connect_locked(&mut slot).await?;
        Err(failure)
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }
}

/// Bounded queue draining into a [`LinkClient`] from its own task.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
    client: LinkClient,
}

impl Outbox {
    /// Spawns the forwarding task. The task connects first, then forwards in
    /// order. An envelope whose send failed is retried once after the link
    /// healed, then dropped with an error line.
    pub fn spawn(client: LinkClient, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let task = forward(client.clone(), rx);
        tokio::spawn(client.inner.log.in_span(task));
        Self { tx, client }
    }

    /// Queues without waiting. A full queue is reported, never silently ignored.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::OutboxFull(self.client.endpoint().clone()),
            mpsc::error::TrySendError::Closed(_) => LinkError::Cancelled,
        })
    }

    pub fn client(&self) -> &LinkClient {
        &self.client
    }
}

async fn forward(client: LinkClient, mut rx: mpsc::Receiver<Envelope>) {
    if client.connect().await.is_err() {
        return;
    }

    loop {
        let envelope = tokio::select! {
            _ = client.inner.cancel.cancelled() => return,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => return,
            },
        };

        // A peer that died without a reset still accepts one write into the
        // socket buffer. That envelope is lost with no error line; the next
        // send sees the reset and heals the link.
        match client.send(&envelope).await {
            Ok(()) => debug!(endpoint = %client.endpoint(), kind = envelope.kind(), "envelope sent"),
            Err(LinkError::Cancelled) => return,
            Err(_) => match client.send(&envelope).await {
                Ok(()) => info!(endpoint = %client.endpoint(), kind = envelope.kind(), "envelope sent after reconnect"),
                Err(LinkError::Cancelled) => return,
                Err(e) => error!(
                    endpoint = %client.endpoint(),
                    kind = envelope.kind(),
                    error = %e,
                    "envelope dropped"
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::read_frame;
    use tokio::net::TcpListener;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn client(port: u16, cancel: &CancellationToken) -> LinkClient {
        LinkClient::new(
            Endpoint::new("127.0.0.1", port),
            Duration::from_millis(100),
            cancel.clone(),
            LogContext::disabled(),
        )
    }

    #[tokio::test]
    async fn send_before_connect_fails_fast_then_heals() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let client = client(port, &cancel);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let err = client.send(&Envelope::CheckMessage).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(_)));
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.reconnects(), 1);

        let (mut peer, _) = listener.accept().await.unwrap();
        client.send(&Envelope::CheckMessage).await.unwrap();
        let body = read_frame(&mut peer).await.unwrap();
        assert_eq!(Envelope::from_json(&body).unwrap(), Envelope::CheckMessage);
    }

    #[tokio::test]
    async fn reconnect_converges_once_server_listens() {
        let port = free_port().await;
        let cancel = CancellationToken::new();
        let client = client(port, &cancel);

        let connecting = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_ne!(client.state(), ConnectionState::Connected);

        let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::time::timeout(Duration::from_millis(500), client.wait_connected())
            .await
            .expect("client should connect within one retry interval");
        assert!(connecting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancellation_ends_the_retry_loop() {
        let port = free_port().await;
        let cancel = CancellationToken::new();
        let client = client(port, &cancel);

        let connecting = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), connecting).await.unwrap().unwrap();
        assert!(matches!(res, Err(LinkError::Cancelled)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn outbox_forwards_in_order_and_reports_full() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let outbox = Outbox::spawn(client(port, &cancel), 4);

        let (mut peer, _) = listener.accept().await.unwrap();
        outbox.client().wait_connected().await;
        for data in 0..3 {
            outbox
                .try_send(Envelope::command(farm_protocol::SystemCode::new("Z1"), "sm_eq", data))
                .unwrap();
        }
        for data in 0..3 {
            let body = read_frame(&mut peer).await.unwrap();
            match Envelope::from_json(&body).unwrap() {
                Envelope::Command(cmd) => assert_eq!(cmd.data, data),
                other => panic!("unexpected {other:?}"),
            }
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn first_write_to_a_closed_peer_is_lost_then_the_link_heals() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let client = client(port, &cancel);
        client.connect().await.unwrap();

        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // lands in the socket buffer of a dead connection
        client.send(&Envelope::CheckMessage).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.reconnects(), 0);

        assert!(client.send(&Envelope::CheckMessage).await.is_err());
        assert_eq!(client.reconnects(), 1);
        assert_eq!(client.state(), ConnectionState::Connected);

        let (mut peer, _) = listener.accept().await.unwrap();
        client.send(&Envelope::CheckMessage).await.unwrap();
        let body = read_frame(&mut peer).await.unwrap();
        assert_eq!(Envelope::from_json(&body).unwrap(), Envelope::CheckMessage);
        cancel.cancel();
    }
}
