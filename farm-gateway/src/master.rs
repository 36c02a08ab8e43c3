/**
 * CONTRÔLEUR MAÎTRE - Routage des commandes vers les esclaves
 *
 * RÔLE :
 * Le maître parle au cloud et possède un lien sortant par esclave. Il reçoit
 * la télémétrie poussée par les esclaves et la remet au puits cloud.
 *
 * FONCTIONNEMENT :
 * - Un LinkClient + Outbox par esclave, démarrés dès la construction
 * - Index plat code système -> esclave, construit depuis les registres
 * - dispatch() : code local = trame encodée ici (rendue au relais),
 *   broadcast = trame locale + enveloppe broadcast vers chaque esclave,
 *   sinon route_command() vers l'esclave propriétaire
 * - CloudPoller : interroge le flux de commandes à chaque cycle du relais
 */

use crate::cloud::{CloudError, CommandFeed, TelemetrySink};
use crate::config::{LinkConf, Topology};
use crate::logging::LogContext;
use crate::registry::RegistryError;
use crate::relay::CommandPoller;
use crate::transport::{EnvelopeHandler, LinkClient, LinkError, Outbox};
use farm_protocol::{check_command, encode_command, CodecError, CommandEnvelope, EncodedCommand, Envelope, SystemCode};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Envelopes waiting for one slave link.
pub const OUTBOX_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Outcome of one dispatched command.
#[derive(Debug)]
pub enum Dispatched {
    /// Frames for the master's own serial ports.
    Local(Vec<EncodedCommand>),
    /// Handed to the outbox of the slave at this index.
    Forwarded(usize),
}

#[derive(Clone)]
pub struct MasterController {
    inner: Arc<MasterInner>,
}

struct MasterInner {
    topology: Arc<Topology>,
    outboxes: Vec<Outbox>,
    routes: HashMap<SystemCode, usize>,
    log: LogContext,
}

impl MasterController {
    /// Opens one outbound link per configured slave. Connection happens in
    /// the background; see [`MasterController::wait_for_slaves`].
    pub fn start(topology: Arc<Topology>, link: &LinkConf, cancel: CancellationToken, log: LogContext) -> Self {
        let outboxes = topology
            .identities
            .slaves
            .iter()
            .map(|slave| {
                let client = LinkClient::new(slave.endpoint.clone(), link.retry_delay(), cancel.clone(), log.clone());
                Outbox::spawn(client, OUTBOX_CAPACITY)
            })
            .collect();

        let mut routes = HashMap::new();
        for (index, slave) in topology.identities.slaves.iter().enumerate() {
            for code in slave.registry.codes() {
                if let Some(owner) = routes.get(code) {
                    warn!(parent: log.span(), code = %code, owner, ignored = index, "system code owned by two slaves, first one wins");
                    continue;
                }
                routes.insert(code.clone(), index);
            }
        }
        info!(parent: log.span(), slaves = topology.identities.slaves.len(), codes = routes.len(), "master controller started");

        Self {
            inner: Arc::new(MasterInner { topology, outboxes, routes, log }),
        }
    }

    /// Blocks until every slave link is connected (or the links are shut down).
    pub async fn wait_for_slaves(&self) {
        for outbox in &self.inner.outboxes {
            outbox.client().wait_connected().await;
        }
        info!(parent: self.inner.log.span(), "all slave links connected");
    }

    pub fn outboxes(&self) -> &[Outbox] {
        &self.inner.outboxes
    }

    /// Slave index owning `code`, if any.
    pub fn route_of(&self, code: &SystemCode) -> Option<usize> {
        self.inner.routes.get(code).copied()
    }

    /// Sends `cmd` to the slave owning its system code.
    pub fn route_command(&self, cmd: &CommandEnvelope) -> Result<usize, DispatchError> {
        let index = self
            .route_of(&cmd.system_code)
            .ok_or_else(|| RegistryError::UnknownSystemCode(cmd.system_code.clone()))?;
        check_command(&cmd.action, cmd.data)?;
        self.inner.outboxes[index].try_send(Envelope::Command(cmd.clone()))?;
        debug!(parent: self.inner.log.span(), code = %cmd.system_code, slave = index, action = %cmd.action, "command routed");
        Ok(index)
    }

    /// Applies one cloud command. Broadcast frames are returned as local
    /// frames even when some slave outbox refused the envelope.
    pub fn dispatch(&self, cmd: &CommandEnvelope) -> Result<Dispatched, DispatchError> {
        let inner = &self.inner;
        if cmd.system_code.is_broadcast() {
            let frame = encode_command(inner.topology.broadcast_uid, &cmd.action, cmd.data)?;
            for outbox in &inner.outboxes {
                if let Err(e) = outbox.try_send(Envelope::Command(cmd.clone())) {
                    warn!(parent: inner.log.span(), endpoint = %outbox.client().endpoint(), error = %e, "broadcast not forwarded");
                }
            }
            return Ok(Dispatched::Local(vec![frame]));
        }

        if let Some(uid) = inner.topology.identities.master.registry.uid_of(&cmd.system_code) {
            let frame = encode_command(uid, &cmd.action, cmd.data)?;
            return Ok(Dispatched::Local(vec![frame]));
        }

        self.route_command(cmd).map(Dispatched::Forwarded)
    }

    /// Handler for the master's link server: slave telemetry goes to `sink`.
    pub fn telemetry_handler(&self, sink: Arc<dyn TelemetrySink>) -> Arc<dyn EnvelopeHandler> {
        Arc::new(TelemetryRelay {
            sink,
            log: self.inner.log.clone(),
        })
    }
}

struct TelemetryRelay {
    sink: Arc<dyn TelemetrySink>,
    log: LogContext,
}

impl EnvelopeHandler for TelemetryRelay {
    fn handle(&self, envelope: Envelope, peer: SocketAddr) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match envelope {
                Envelope::Telemetry { batch } => {
                    debug!(parent: self.log.span(), %peer, codes = batch.len(), "telemetry from slave");
                    if let Err(e) = self.sink.publish(batch).await {
                        warn!(parent: self.log.span(), %peer, error = %e, "slave telemetry not published");
                    }
                }
                other => {
                    warn!(parent: self.log.span(), %peer, kind = other.kind(), "unexpected envelope on master link, dropped");
                }
            }
        })
    }
}

/// Relay-side poller: fetches cloud commands since the last successful check
/// and dispatches them.
pub struct CloudPoller {
    feed: Arc<dyn CommandFeed>,
    master: MasterController,
    last_check: Mutex<i64>,
}

impl CloudPoller {
    pub fn new(feed: Arc<dyn CommandFeed>, master: MasterController) -> Self {
        Self {
            feed,
            master,
            last_check: Mutex::new(OffsetDateTime::now_utc().unix_timestamp()),
        }
    }

    pub fn last_check(&self) -> i64 {
        *self.last_check.lock()
    }

    async fn poll_once(&self) -> Result<Vec<EncodedCommand>, CloudError> {
        let since = self.last_check();
        let started = OffsetDateTime::now_utc().unix_timestamp();
        let commands = self.feed.fetch_commands(since).await?;
        *self.last_check.lock() = started;

        let log = &self.master.inner.log;
        let mut frames = Vec::new();
        for cmd in &commands {
            match self.master.dispatch(cmd) {
                Ok(Dispatched::Local(local)) => frames.extend(local),
                Ok(Dispatched::Forwarded(_)) => {}
                Err(e) => warn!(
                    parent: log.span(),
                    code = %cmd.system_code,
                    action = %cmd.action,
                    data = cmd.data,
                    error = %e,
                    "cloud command dropped"
                ),
            }
        }
        Ok(frames)
    }
}

impl CommandPoller for CloudPoller {
    fn poll(&self) -> BoxFuture<'_, Result<Vec<EncodedCommand>, CloudError>> {
        Box::pin(self.poll_once())
    }
}
