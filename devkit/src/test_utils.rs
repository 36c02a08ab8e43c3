/*!
Harnais de test pour la passerelle

Facilite l'écriture des tests d'intégration avec :
- construction de topologies sur 127.0.0.1 (ports libres)
- serveur de lien qui capture les enveloppes reçues
- attente bornée de conditions asynchrones
*/

use anyhow::{bail, Result};
use farm_gateway::config::{Endpoint, GatewayConfig, LinkConf, Profile, SystemConf};
use farm_gateway::ingestor::IngestTiming;
use farm_gateway::relay::RelayTiming;
use farm_gateway::transport::{ConnectionSet, EnvelopeHandler, LinkServer};
use farm_gateway::{LogContext, NodeTiming};
use farm_protocol::{CommandEnvelope, Envelope};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Logs des tests visibles avec `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Port TCP libre au moment de l'appel.
pub async fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// Attend que `check` devienne vrai, en sondant toutes les 10ms.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if check() {
        return Ok(());
    }
    bail!("condition not reached within {timeout:?}")
}

/// Cadences resserrées pour que les scénarios tiennent en quelques centaines de ms.
pub fn fast_timing() -> NodeTiming {
    NodeTiming {
        relay: RelayTiming {
            healthy: Duration::from_millis(20),
            degraded: Duration::from_millis(80),
            byte_pacing: Duration::ZERO,
        },
        ingest: IngestTiming {
            cadence: Duration::from_millis(20),
            read_pacing: Duration::ZERO,
        },
    }
}

/// Topologie de test, tous les nœuds sur 127.0.0.1.
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    systems: Vec<SystemConf>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(mut self, profile: Profile, port: u16, codes: &[(&str, &str)]) -> Self {
        self.systems.push(SystemConf {
            profile,
            ip: "127.0.0.1".into(),
            port,
            start: false,
            system_codes: codes
                .iter()
                .map(|(code, uid)| (code.to_string(), uid.to_string()))
                .collect::<BTreeMap<_, _>>(),
        });
        self
    }

    pub fn master(self, port: u16, codes: &[(&str, &str)]) -> Self {
        self.node(Profile::Master, port, codes)
    }

    pub fn slave(self, port: u16, codes: &[(&str, &str)]) -> Self {
        self.node(Profile::Slave, port, codes)
    }

    /// Configuration dont le nœud `index` (ordre de déclaration) est local.
    pub fn config_for(&self, index: usize) -> GatewayConfig {
        let mut systems = self.systems.clone();
        for (i, system) in systems.iter_mut().enumerate() {
            system.start = i == index;
        }
        GatewayConfig {
            systems,
            broadcast: Default::default(),
            serial: Default::default(),
            watchdog_interval: 3600,
            logging: Default::default(),
            link: LinkConf {
                retry_delay_secs: 1,
                read_timeout_secs: 5,
                probe_interval_secs: 1,
                probe_pacing_ms: 0,
            },
            api_server: None,
            dashboard: None,
        }
    }
}

/// Serveur de lien qui garde toutes les enveloppes reçues (hors sondes).
pub struct CapturingServer {
    pub addr: SocketAddr,
    pub connections: ConnectionSet,
    received: Arc<Mutex<Vec<Envelope>>>,
    cancel: CancellationToken,
}

struct Capture(Arc<Mutex<Vec<Envelope>>>);

impl EnvelopeHandler for Capture {
    fn handle(&self, envelope: Envelope, _peer: SocketAddr) -> BoxFuture<'_, ()> {
        self.0.lock().push(envelope);
        Box::pin(async {})
    }
}

impl CapturingServer {
    pub async fn start(port: u16) -> Result<Self> {
        let server = LinkServer::bind(&Endpoint::new("127.0.0.1", port), Duration::from_secs(5), LogContext::disabled()).await?;
        let addr = server.local_addr()?;
        let connections = server.connections();
        let received = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        server.spawn(Arc::new(Capture(received.clone())), cancel.clone());
        Ok(Self { addr, connections, received, cancel })
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }

    pub fn commands(&self) -> Vec<CommandEnvelope> {
        self.received
            .lock()
            .iter()
            .filter_map(|envelope| match envelope {
                Envelope::Command(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Result<Vec<Envelope>> {
        wait_until(timeout, || self.received.lock().len() >= count).await?;
        Ok(self.envelopes())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for CapturingServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
