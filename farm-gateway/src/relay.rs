/**
 * RELAIS DE COMMANDES - Unique écrivain des ports série
 *
 * RÔLE :
 * Découple les producteurs de commandes (cloud, chien de garde, commandes
 * reçues d'un pair) de l'écriture série, qui reste mono-écrivain.
 *
 * FONCTIONNEMENT :
 * - TransferQueue = file bornée (100) de trames déjà encodées
 *   push() attend qu'une place se libère, try_push() rend la trame si pleine
 * - CommandRelay = boucle : attente 2s (8s si l'amont est injoignable),
 *   commandes de l'amont + vidage de la file, puis écriture de chaque trame
 *   sur chaque port, octet par octet, 1ms entre deux octets
 * - Échec d'écriture série = RelayError, le processus doit redémarrer
 */

use crate::cloud::CloudError;
use crate::health::HealthTracker;
use crate::logging::LogContext;
use crate::serial::{write_paced, SerialError, SerialPorts};
use farm_protocol::EncodedCommand;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TRANSFER_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("transfer queue full, frame {} rejected", .0.hex)]
    Full(Box<EncodedCommand>),
    #[error("transfer queue closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("serial hardware fault: {0}")]
    Hardware(#[from] SerialError),
}

/// Producer side of the transfer queue.
#[derive(Clone)]
pub struct TransferQueue {
    tx: mpsc::Sender<EncodedCommand>,
}

/// Consumer side, owned by the relay.
pub struct TransferReceiver {
    rx: mpsc::Receiver<EncodedCommand>,
}

pub fn transfer_queue(capacity: usize) -> (TransferQueue, TransferReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (TransferQueue { tx }, TransferReceiver { rx })
}

impl TransferQueue {
    /// Waits for room when the queue is full.
    pub async fn push(&self, frame: EncodedCommand) -> Result<(), QueueError> {
        self.tx.send(frame).await.map_err(|_| QueueError::Closed)
    }

    /// Fails with the frame when the queue is full.
    pub fn try_push(&self, frame: EncodedCommand) -> Result<(), QueueError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(frame) => QueueError::Full(Box::new(frame)),
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransferReceiver {
    /// Everything queued right now, oldest first.
    pub fn drain(&mut self) -> Vec<EncodedCommand> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Upstream source of commands polled once per relay cycle.
pub trait CommandPoller: Send + Sync {
    /// Frames to write this cycle. An error marks the upstream unreachable.
    fn poll(&self) -> BoxFuture<'_, Result<Vec<EncodedCommand>, CloudError>>;
}

/// Poller of nodes without an upstream (slaves).
pub struct NoPoller;

impl CommandPoller for NoPoller {
    fn poll(&self) -> BoxFuture<'_, Result<Vec<EncodedCommand>, CloudError>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayTiming {
    pub healthy: Duration,
    pub degraded: Duration,
    pub byte_pacing: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            healthy: Duration::from_secs(2),
            degraded: Duration::from_secs(8),
            byte_pacing: Duration::from_millis(1),
        }
    }
}

pub struct CommandRelay {
    receiver: TransferReceiver,
    ports: SerialPorts,
    poller: Arc<dyn CommandPoller>,
    timing: RelayTiming,
    health: HealthTracker,
    upstream_ok: bool,
    log: LogContext,
}

impl CommandRelay {
    pub fn new(
        receiver: TransferReceiver,
        ports: SerialPorts,
        poller: Arc<dyn CommandPoller>,
        health: HealthTracker,
        log: LogContext,
    ) -> Self {
        Self {
            receiver,
            ports,
            poller,
            timing: RelayTiming::default(),
            health,
            upstream_ok: true,
            log,
        }
    }

    pub fn with_timing(mut self, timing: RelayTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Current wait between two cycles.
    pub fn cadence(&self) -> Duration {
        if self.upstream_ok {
            self.timing.healthy
        } else {
            self.timing.degraded
        }
    }

    /// Runs until cancelled. A serial write failure ends the loop with an error.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RelayError> {
        let log = self.log.clone();
        log.in_span(self.run_loop(cancel)).await
    }

    async fn run_loop(mut self, cancel: CancellationToken) -> Result<(), RelayError> {
        info!(ports = self.ports.len(), "command relay started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("command relay stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.cadence()) => {}
            }
            self.cycle().await?;
        }
    }

    /// One cycle: poll upstream, drain the queue, write everything.
    /// Returns the number of frames written.
    pub async fn cycle(&mut self) -> Result<usize, RelayError> {
        let mut frames = match self.poller.poll().await {
            Ok(frames) => {
                if !self.upstream_ok {
                    info!("upstream reachable again");
                }
                self.upstream_ok = true;
                self.health.mark_upstream_connected();
                frames
            }
            Err(e) => {
                self.upstream_ok = false;
                self.health.mark_upstream_degraded();
                warn!(error = %e, retry_in = ?self.timing.degraded, "upstream unreachable");
                Vec::new()
            }
        };
        frames.extend(self.receiver.drain());

        for frame in &frames {
            for (name, port) in self.ports.iter() {
                write_paced(port, &frame.bytes, self.timing.byte_pacing).await?;
                debug!(port = name, "frame written");
            }
            self.health.record_frame_written();
            info!(uid = %frame.uid, action = frame.action, value = frame.value, hex = %frame.hex, ">>> sent command");
        }
        Ok(frames.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::mock::MockSerialPort;
    use farm_protocol::{encode_command, Uid};
    use parking_lot::Mutex;

    fn frame(value: i64) -> EncodedCommand {
        encode_command(Uid::new(0xAAAA_AAAA), "air_extraction", value).unwrap()
    }

    fn fast() -> RelayTiming {
        RelayTiming {
            healthy: Duration::from_millis(5),
            degraded: Duration::from_millis(20),
            byte_pacing: Duration::ZERO,
        }
    }

    struct ScriptedPoller(Mutex<Vec<Result<Vec<EncodedCommand>, CloudError>>>);

    impl CommandPoller for ScriptedPoller {
        fn poll(&self) -> BoxFuture<'_, Result<Vec<EncodedCommand>, CloudError>> {
            let next = self.0.lock().pop().unwrap_or(Ok(Vec::new()));
            Box::pin(async move { next })
        }
    }

    #[tokio::test]
    async fn queue_bound_is_explicit() {
        let (queue, mut rx) = transfer_queue(TRANSFER_QUEUE_CAPACITY);
        for value in 0..100 {
            queue.try_push(frame(value)).unwrap();
        }
        assert_eq!(queue.len(), 100);

        match queue.try_push(frame(100)) {
            Err(QueueError::Full(rejected)) => assert_eq!(rejected.value, 100),
            other => panic!("expected Full, got {other:?}"),
        }

        // the blocking producer waits instead of dropping
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.push(frame(100))).await;
        assert!(blocked.is_err());

        let pending = tokio::spawn({
            let queue = queue.clone();
            async move { queue.push(frame(100)).await }
        });
        let mut drained = rx.drain();
        pending.await.unwrap().unwrap();
        drained.extend(rx.drain());
        assert_eq!(drained.len(), 101);
        assert_eq!(drained[0].value, 0);
        assert_eq!(drained[100].value, 100);
    }

    #[tokio::test]
    async fn cycle_writes_every_frame_to_every_port() {
        let a = MockSerialPort::new("/dev/ttyACM0");
        let b = MockSerialPort::new("/dev/ttyACM1");
        let (queue, rx) = transfer_queue(TRANSFER_QUEUE_CAPACITY);
        let polled = frame(7);
        let queued = frame(9);
        queue.push(queued.clone()).await.unwrap();

        let poller = Arc::new(ScriptedPoller(Mutex::new(vec![Ok(vec![polled.clone()])])));
        let mut relay = CommandRelay::new(
            rx,
            SerialPorts::new(vec![a.boxed(), b.boxed()]),
            poller,
            HealthTracker::new(),
            LogContext::disabled(),
        )
        .with_timing(fast());

        assert_eq!(relay.cycle().await.unwrap(), 2);
        let expected: Vec<u8> = [polled.bytes, queued.bytes].concat();
        assert_eq!(a.written(), expected);
        assert_eq!(b.written(), expected);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_widens_cadence() {
        let (_queue, rx) = transfer_queue(4);
        let poller = Arc::new(ScriptedPoller(Mutex::new(vec![
            Ok(Vec::new()),
            Err(CloudError::Unreachable("timeout".into())),
        ])));
        let health = HealthTracker::new();
        let mut relay = CommandRelay::new(rx, SerialPorts::default(), poller, health.clone(), LogContext::disabled())
            .with_timing(fast());

        assert_eq!(relay.cadence(), Duration::from_millis(5));
        relay.cycle().await.unwrap();
        assert_eq!(relay.cadence(), Duration::from_millis(20));
        assert_eq!(health.upstream_failures(), 1);
        relay.cycle().await.unwrap();
        assert_eq!(relay.cadence(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn write_failure_is_a_hardware_fault() {
        let port = MockSerialPort::new("/dev/ttyACM0");
        port.fail_writes(true);
        let (queue, rx) = transfer_queue(4);
        queue.push(frame(1)).await.unwrap();
        let relay = CommandRelay::new(
            rx,
            SerialPorts::new(vec![port.boxed()]),
            Arc::new(NoPoller),
            HealthTracker::new(),
            LogContext::disabled(),
        )
        .with_timing(fast());

        let res = tokio::time::timeout(Duration::from_secs(1), relay.run(CancellationToken::new()))
            .await
            .unwrap();
        assert!(matches!(res, Err(RelayError::Hardware(SerialError::Io { .. }))));
    }
}
