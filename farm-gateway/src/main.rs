/**
 * FARM GATEWAY - Point d'entrée d'un nœud (maître ou esclave)
 *
 * RÔLE : charge la configuration, valide la topologie, ouvre les ports série
 * puis démarre le nœud marqué `start: true`.
 * ARRÊT : Ctrl-C annule toutes les boucles ; une panne série termine le
 * processus avec le code 1 (le superviseur relance et ré-énumère les ports).
 */

use anyhow::{anyhow, Context};
use farm_gateway::cloud::{CommandFeed, HttpCloud, LoggingSink, TelemetrySink};
use farm_gateway::config::{config_path, load_config, Topology};
use farm_gateway::serial::open_matching;
use farm_gateway::{logging, Collaborators, GatewayNode, LogContext, NodeTiming};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    let path = config_path();
    let cfg = load_config(&path)
        .await
        .with_context(|| format!("cannot load configuration from {}", path.display()))?;
    let topology = Arc::new(Topology::from_config(&cfg).context("invalid topology")?);
    logging::init(&cfg.logging.level).map_err(|e| anyhow!("logging init failed: {e}"))?;

    let log = LogContext::root(topology.profile());
    log.in_scope(|| info!(config = %path.display(), node = %topology.local_node().endpoint, "starting gateway"));

    let ports = open_matching(&cfg.serial).context("cannot open serial ports")?;

    let cloud = match &cfg.api_server {
        Some(conf) => {
            let http = Arc::new(HttpCloud::new(conf, log.component("cloud"))?);
            let feed: Arc<dyn CommandFeed> = http.clone();
            let sink: Arc<dyn TelemetrySink> = http;
            Collaborators { feed: Some(feed), sink }
        }
        None => Collaborators {
            feed: None,
            sink: Arc::new(LoggingSink::new(log.component("cloud"))),
        },
    };

    let cancel = CancellationToken::new();
    let startup = GatewayNode::start(&cfg, topology, ports, cloud, NodeTiming::default(), cancel.clone(), log.clone());
    let node = tokio::select! {
        res = startup => res?,
        _ = tokio::signal::ctrl_c() => {
            info!(parent: log.span(), "shutdown requested during startup");
            cancel.cancel();
            return Ok(());
        }
    };

    let running = node.wait();
    tokio::pin!(running);
    tokio::select! {
        res = &mut running => {
            if let Err(e) = res {
                error!(parent: log.span(), error = %e, "fatal gateway fault, exiting");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(parent: log.span(), "shutdown requested");
            cancel.cancel();
            if let Err(e) = running.await {
                error!(parent: log.span(), error = %e, "gateway stopped with an error");
            }
        }
    }
    Ok(())
}
