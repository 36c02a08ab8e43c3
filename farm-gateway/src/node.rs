//! Assembles one gateway node from a validated topology.
//!
//! Start order: shared state, link server, local controller (the master waits
//! for every slave link, a slave waits for `MasterInitialized`), then the
//! relay, ingestor, watchdog, liveness probe and dashboard tasks.

use crate::cloud::{CommandFeed, TelemetrySink};
use crate::config::{GatewayConfig, LocalRole, Topology};
use crate::health::HealthTracker;
use crate::http::{self, DashboardState};
use crate::ingestor::{IngestTiming, TelemetryIngestor, Uplink};
use crate::logging::LogContext;
use crate::master::{CloudPoller, MasterController};
use crate::relay::{transfer_queue, CommandPoller, CommandRelay, NoPoller, RelayError, RelayTiming, TransferQueue, TRANSFER_QUEUE_CAPACITY};
use crate::serial::{SerialError, SerialPorts};
use crate::slave::SlaveController;
use crate::status::StatusBoard;
use crate::transport::{ConnectionSet, LinkClient, LinkError, LinkServer, LivenessProbe, Outbox};
use crate::watchdog::Watchdog;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("serial read failed: {0}")]
    Ingest(#[from] SerialError),
    #[error("gateway task aborted: {0}")]
    Task(#[from] JoinError),
}

/// Cloud side of a master. Slaves ignore it.
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Option<Arc<dyn CommandFeed>>,
    pub sink: Arc<dyn TelemetrySink>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeTiming {
    pub relay: RelayTiming,
    pub ingest: IngestTiming,
}

pub struct GatewayNode {
    pub board: StatusBoard,
    pub health: HealthTracker,
    pub queue: TransferQueue,
    pub links: Vec<LinkClient>,
    pub inbound: ConnectionSet,
    pub server_addr: SocketAddr,
    relay: JoinHandle<Result<(), RelayError>>,
    ingestor: JoinHandle<Result<(), SerialError>>,
}

impl GatewayNode {
    pub async fn start(
        cfg: &GatewayConfig,
        topology: Arc<Topology>,
        ports: SerialPorts,
        cloud: Collaborators,
        timing: NodeTiming,
        cancel: CancellationToken,
        log: LogContext,
    ) -> Result<Self, NodeError> {
        let board = StatusBoard::new();
        let health = HealthTracker::new();
        let (queue, receiver) = transfer_queue(TRANSFER_QUEUE_CAPACITY);

        let local = topology.local_node();
        let server = LinkServer::bind(&local.endpoint, cfg.link.read_timeout(), log.component("link-server")).await?;
        let server_addr = server.local_addr()?;
        let inbound = server.connections();

        let (poller, uplink, outboxes): (Arc<dyn CommandPoller>, Uplink, Vec<Outbox>) = match topology.local {
            LocalRole::Master => {
                let master = MasterController::start(topology.clone(), &cfg.link, cancel.clone(), log.component("master"));
                server.spawn(master.telemetry_handler(cloud.sink.clone()), cancel.clone());
                master.wait_for_slaves().await;
                if cancel.is_cancelled() {
                    return Err(LinkError::Cancelled.into());
                }
                let poller: Arc<dyn CommandPoller> = match cloud.feed {
                    Some(feed) => Arc::new(CloudPoller::new(feed, master.clone())),
                    None => Arc::new(NoPoller),
                };
                (poller, Uplink::Cloud(cloud.sink), master.outboxes().to_vec())
            }
            LocalRole::Slave(_) => {
                let slave = SlaveController::start(&topology, &cfg.link, cancel.clone(), log.component("slave"));
                server.spawn(slave.command_handler(queue.clone()), cancel.clone());
                if !slave.wait_master_initialized().await {
                    return Err(LinkError::Cancelled.into());
                }
                let uplink = slave.uplink().clone();
                (Arc::new(NoPoller), Uplink::Master(uplink.clone()), vec![uplink])
            }
        };
        let links: Vec<LinkClient> = outboxes.iter().map(|o| o.client().clone()).collect();

        let relay = CommandRelay::new(receiver, ports.clone(), poller, health.clone(), log.component("relay"))
            .with_timing(timing.relay);
        let relay = tokio::spawn(relay.run(cancel.clone()));

        let ingestor = TelemetryIngestor::new(
            topology.clone(),
            ports.clone(),
            board.clone(),
            queue.clone(),
            uplink,
            log.component("ingestor"),
        )
        .with_timing(timing.ingest);
        let ingestor = tokio::spawn(ingestor.run(cancel.clone()));

        let watchdog = Watchdog::new(
            topology.broadcast_uid,
            Duration::from_secs(cfg.watchdog_interval),
            queue.clone(),
            log.component("watchdog"),
        );
        tokio::spawn(watchdog.run(cancel.clone()));

        let probe = LivenessProbe::new(
            outboxes,
            cfg.link.probe_interval(),
            cfg.link.probe_pacing(),
            log.component("probe"),
        );
        tokio::spawn(probe.run(cancel.clone()));

        if let Some(conf) = cfg.dashboard.clone() {
            let state = DashboardState {
                topology: topology.clone(),
                board: board.clone(),
                health: health.clone(),
                ports,
                links: links.clone(),
                inbound: inbound.clone(),
            };
            let dash_log = log.component("dashboard");
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = http::serve(&conf, state, cancel, dash_log.clone()).await {
                    error!(parent: dash_log.span(), error = %e, "dashboard stopped");
                }
            });
        }

        info!(parent: log.span(), %server_addr, profile = %topology.profile(), "gateway node running");
        Ok(Self {
            board,
            health,
            queue,
            links,
            inbound,
            server_addr,
            relay,
            ingestor,
        })
    }

    /// Waits for the relay or the ingestor to end. After cancellation both
    /// end cleanly; a serial fault ends them with an error.
    pub async fn wait(self) -> Result<(), NodeError> {
        let GatewayNode { mut relay, mut ingestor, .. } = self;
        tokio::select! {
            res = &mut relay => res??,
            res = &mut ingestor => res??,
        }
        Ok(())
    }
}
