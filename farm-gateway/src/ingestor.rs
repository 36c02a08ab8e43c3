/**
 * INGESTION TÉLÉMÉTRIE - Lecture série, décodage, routage des mesures
 *
 * RÔLE :
 * Unique lecteur des ports série. Transforme les octets reçus des
 * microcontrôleurs en mesures (vers le cloud ou le maître) et en commandes
 * inter-zones (vers la file de transfert).
 *
 * FONCTIONNEMENT :
 * - Balayage toutes les 2s : pour chaque port, vidage des octets en attente
 *   (1ms entre deux lectures), découpe en fenêtres de 21 octets, décodage
 * - UID -> code système via le registre ; UID inconnu = trame abandonnée
 * - Item Main : tableau d'état + dernière valeur + lot sortant (code décalé
 *   pour les mesures _ext)
 * - Item Command : ré-encodé pour chaque code local hors toit ('T')
 * - Fin de balayage : lot non vide -> cloud (maître) ou lien montant (esclave)
 */

use crate::cloud::TelemetrySink;
use crate::config::Topology;
use crate::logging::LogContext;
use crate::relay::TransferQueue;
use crate::serial::{drain_available, SerialError, SerialPorts};
use crate::status::StatusBoard;
use crate::transport::Outbox;
use farm_protocol::codec::hex_string;
use farm_protocol::{decode, encode_command, split_wire_chunks, DataPoint, EncodedCommand, Envelope, Item, TelemetryBatch};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a non-empty batch goes after a sweep.
#[derive(Clone)]
pub enum Uplink {
    Cloud(Arc<dyn TelemetrySink>),
    Master(Outbox),
}

#[derive(Debug, Clone, Copy)]
pub struct IngestTiming {
    pub cadence: Duration,
    pub read_pacing: Duration,
}

impl Default for IngestTiming {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(2),
            read_pacing: Duration::from_millis(1),
        }
    }
}

/// What one sweep produced.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub frames: usize,
    pub dropped_frames: usize,
    pub forwarded: Vec<EncodedCommand>,
    pub batch: TelemetryBatch,
}

pub struct TelemetryIngestor {
    topology: Arc<Topology>,
    ports: SerialPorts,
    board: StatusBoard,
    queue: TransferQueue,
    uplink: Uplink,
    timing: IngestTiming,
    log: LogContext,
}

impl TelemetryIngestor {
    pub fn new(
        topology: Arc<Topology>,
        ports: SerialPorts,
        board: StatusBoard,
        queue: TransferQueue,
        uplink: Uplink,
        log: LogContext,
    ) -> Self {
        Self {
            topology,
            ports,
            board,
            queue,
            uplink,
            timing: IngestTiming::default(),
            log,
        }
    }

    pub fn with_timing(mut self, timing: IngestTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Sweeps until cancelled. A serial read failure ends the loop.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SerialError> {
        let log = self.log.clone();
        log.in_span(self.run_loop(cancel)).await
    }

    async fn run_loop(self, cancel: CancellationToken) -> Result<(), SerialError> {
        info!(ports = self.ports.len(), "telemetry ingestor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("telemetry ingestor stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.timing.cadence) => {}
            }
            self.sweep().await?;
        }
    }

    /// Reads every port once, then ships the batch.
    pub async fn sweep(&self) -> Result<SweepReport, SerialError> {
        let mut report = SweepReport::default();
        for (name, port) in self.ports.iter() {
            let Some(raw) = drain_available(port, self.timing.read_pacing).await? else {
                continue;
            };
            debug!(parent: self.log.span(), port = name, bytes = raw.len(), "serial data received");
            for chunk in split_wire_chunks(&raw) {
                self.ingest_chunk(name, chunk, &mut report);
            }
        }

        for frame in &report.forwarded {
            if let Err(e) = self.queue.push(frame.clone()).await {
                warn!(parent: self.log.span(), uid = %frame.uid, hex = %frame.hex, error = %e, "forwarded command not queued");
            }
        }

        if !report.batch.is_empty() {
            self.ship(report.batch.clone()).await;
        }
        Ok(report)
    }

    fn ingest_chunk(&self, port: &str, chunk: &[u8], report: &mut SweepReport) {
        let frame = match decode(chunk) {
            Ok(frame) => frame,
            Err(e) => {
                report.dropped_frames += 1;
                warn!(parent: self.log.span(), port, raw = %hex_string(chunk), error = %e, "frame dropped");
                return;
            }
        };
        for rejected in &frame.rejected {
            warn!(
                parent: self.log.span(),
                port,
                uid = %frame.uid,
                raw = %hex_string(&rejected.raw),
                error = %rejected.reason,
                "item dropped"
            );
        }

        let code = match self.topology.identities.resolve_system_code(self.topology.profile(), frame.uid) {
            Ok(code) => code,
            Err(e) => {
                report.dropped_frames += 1;
                warn!(parent: self.log.span(), port, raw = %hex_string(chunk), error = %e, "frame from unknown device dropped");
                return;
            }
        };
        report.frames += 1;

        let now = OffsetDateTime::now_utc();
        for item in &frame.items {
            match item {
                Item::Main(main) => {
                    let routed = main.routing_code(&code);
                    self.board.touch(frame.uid, &code, port, now);
                    self.board.record_value(&routed, main.name(), main.value);
                    report.batch.record(
                        routed.clone(),
                        main.name(),
                        DataPoint {
                            value: main.value,
                            class: main.class(),
                        },
                    );
                    info!(parent: self.log.span(), port, code = %routed, name = main.name(), value = main.value, "<<< received data");
                }
                Item::Command { name, value, .. } => {
                    self.forward_command(&code, name, *value, report);
                }
                Item::Error { name, .. } => {
                    warn!(parent: self.log.span(), port, uid = %frame.uid, code = %code, error = *name, "device reported an error");
                }
                other => {
                    debug!(parent: self.log.span(), port, uid = %frame.uid, kind = %other.kind(), name = other.name(), value = ?other.value(), "item received");
                }
            }
        }
    }

    /// Re-encodes a serial command for every local code outside the roof.
    fn forward_command(&self, sender: &farm_protocol::SystemCode, action: &str, value: u32, report: &mut SweepReport) {
        let registry = &self.topology.local_node().registry;
        for (code, uid) in registry.iter().filter(|(code, _)| !code.is_roof()) {
            match encode_command(uid, action, i64::from(value)) {
                Ok(frame) => {
                    debug!(parent: self.log.span(), from = %sender, to = %code, hex = %frame.hex, "command forwarded");
                    report.forwarded.push(frame);
                }
                Err(e) => {
                    warn!(parent: self.log.span(), from = %sender, to = %code, action, value, error = %e, "command not forwarded");
                }
            }
        }
    }

    async fn ship(&self, batch: TelemetryBatch) {
        match &self.uplink {
            Uplink::Cloud(sink) => {
                if let Err(e) = sink.publish(batch).await {
                    warn!(parent: self.log.span(), error = %e, "telemetry not published");
                }
            }
            Uplink::Master(outbox) => {
                if let Err(e) = outbox.try_send(Envelope::telemetry(batch)) {
                    warn!(parent: self.log.span(), error = %e, "telemetry not sent to master");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudError;
    use crate::config::{Endpoint, LocalRole};
    use crate::registry::{IdentityRegistry, Node, NodeRegistry};
    use crate::relay::transfer_queue;
    use crate::serial::mock::MockSerialPort;
    use farm_protocol::codec::{to_wire, FrameWriter};
    use farm_protocol::{DataClass, ItemKind, SystemCode, Uid, DEFAULT_BROADCAST_UID};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    const ROOF: u32 = 0xC0C0_C0C0;
    const ZONE: u32 = 0xC0C0_C0C1;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TelemetryBatch>>);

    impl TelemetrySink for Recorder {
        fn publish(&self, batch: TelemetryBatch) -> BoxFuture<'_, Result<(), CloudError>> {
            self.0.lock().push(batch);
            Box::pin(async { Ok(()) })
        }
    }

    fn topology() -> Arc<Topology> {
        let registry = NodeRegistry::from_pairs([
            (SystemCode::new("T1R"), Uid::new(ROOF)),
            (SystemCode::new("R1B"), Uid::new(ZONE)),
        ])
        .unwrap();
        Arc::new(Topology {
            local: LocalRole::Master,
            identities: IdentityRegistry::new(
                Node { endpoint: Endpoint::new("127.0.0.1", 1), registry },
                Vec::new(),
            ),
            broadcast_uid: DEFAULT_BROADCAST_UID,
        })
    }

    fn wire(uid: u32, items: &[(ItemKind, u8, u32)]) -> Vec<u8> {
        let mut writer = FrameWriter::new(Uid::new(uid));
        for (kind, subtype, value) in items {
            writer.push(kind.as_byte(), *subtype, *value).unwrap();
        }
        to_wire(&writer.finish())
    }

    fn ingestor(port: &MockSerialPort, sink: Arc<Recorder>) -> (TelemetryIngestor, crate::relay::TransferReceiver, StatusBoard) {
        let (queue, rx) = transfer_queue(8);
        let board = StatusBoard::new();
        let ingestor = TelemetryIngestor::new(
            topology(),
            SerialPorts::new(vec![port.boxed()]),
            board.clone(),
            queue,
            Uplink::Cloud(sink),
            LogContext::disabled(),
        )
        .with_timing(IngestTiming {
            cadence: Duration::from_millis(5),
            read_pacing: Duration::ZERO,
        });
        (ingestor, rx, board)
    }

    fn main_subtype(name: &str) -> u8 {
        farm_protocol::catalog::main_by_name(name).unwrap().subtype
    }

    #[tokio::test]
    async fn main_items_feed_board_and_batch() {
        let port = MockSerialPort::new("/dev/ttyACM0");
        let sink = Arc::new(Recorder::default());
        let (ingestor, _rx, board) = ingestor(&port, sink.clone());

        let mut raw = wire(ZONE, &[(ItemKind::Main, main_subtype("temperature"), 21)]);
        raw.extend(wire(ZONE, &[(ItemKind::Main, main_subtype("humidity"), 40)]));
        port.inject_read(&raw);

        let report = ingestor.sweep().await.unwrap();
        assert_eq!(report.frames, 2);
        let zone = SystemCode::new("R1B");
        assert_eq!(report.batch.get(&zone, "temperature").unwrap().value, 21);
        assert_eq!(report.batch.get(&zone, "temperature").unwrap().class, DataClass::Temperature);
        assert_eq!(board.last_values(&zone)["humidity"], 40);
        assert_eq!(board.entry(Uid::new(ZONE)).unwrap().port, "/dev/ttyACM0");
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn ext_readings_are_recorded_under_the_shifted_code() {
        let port = MockSerialPort::new("/dev/ttyACM0");
        let sink = Arc::new(Recorder::default());
        let (ingestor, _rx, board) = ingestor(&port, sink);
        port.inject_read(&wire(ROOF, &[(ItemKind::Main, main_subtype("temperature_ext"), 19)]));

        let report = ingestor.sweep().await.unwrap();
        assert_eq!(report.batch.get(&SystemCode::new("R1B"), "temperature_ext").unwrap().value, 19);
        assert!(board.last_values(&SystemCode::new("T1R")).is_empty());
        assert_eq!(board.entry(Uid::new(ROOF)).unwrap().system_code, SystemCode::new("T1R"));
    }

    #[tokio::test]
    async fn serial_commands_skip_roof_codes() {
        let port = MockSerialPort::new("/dev/ttyACM0");
        let sink = Arc::new(Recorder::default());
        let (ingestor, mut rx, _board) = ingestor(&port, sink.clone());
        let on_off = farm_protocol::catalog::command_by_name("on_off").unwrap().subtype;
        port.inject_read(&wire(ROOF, &[(ItemKind::Command, on_off, 1)]));

        let report = ingestor.sweep().await.unwrap();
        assert_eq!(report.forwarded.len(), 1);
        let queued = rx.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].uid, Uid::new(ZONE));
        assert!(sink.0.lock().is_empty());
    }

    #[tokio::test]
    async fn unknown_devices_and_garbage_are_dropped() {
        let port = MockSerialPort::new("/dev/ttyACM0");
        let sink = Arc::new(Recorder::default());
        let (ingestor, _rx, board) = ingestor(&port, sink.clone());

        let mut raw = wire(0x1234_5678, &[(ItemKind::Main, main_subtype("temperature"), 21)]);
        raw.extend([0x01, 0x01, 0x00, 0x10, 0xC0, 0xC0, 0xC0, 0xC1, 0xFF]);
        port.inject_read(&raw);

        let report = ingestor.sweep().await.unwrap();
        assert_eq!(report.frames, 0);
        assert_eq!(report.dropped_frames, 2);
        assert!(board.seen_devices().is_empty());
        assert!(sink.0.lock().is_empty());
    }

    #[tokio::test]
    async fn idle_ports_produce_nothing() {
        let port = MockSerialPort::new("/dev/ttyACM0");
        let sink = Arc::new(Recorder::default());
        let (ingestor, _rx, _board) = ingestor(&port, sink.clone());
        let report = ingestor.sweep().await.unwrap();
        assert_eq!(report.frames, 0);
        assert!(report.batch.is_empty());
        assert!(sink.0.lock().is_empty());
    }
}
