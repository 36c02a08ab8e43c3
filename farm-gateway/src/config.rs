/**
 * CONFIGURATION PASSERELLE - Chargement YAML + validation de la topologie
 *
 * RÔLE :
 * Lit le fichier désigné par CONF_FILE (défaut ./config.yaml) et construit la
 * topologie figée du site : un maître, N esclaves, leurs registres UID <-> code.
 *
 * FONCTIONNEMENT :
 * - GatewayConfig = image serde brute du fichier
 * - Topology::from_config = validation stricte (erreur fatale au démarrage)
 * - Les délais des liens et du chien de garde ont des valeurs par défaut
 *
 * UTILITÉ :
 * 🎯 Source unique de la topologie, lue une fois puis immuable
 */

use crate::registry::{IdentityRegistry, Node, NodeRegistry, RegistryError};
use farm_protocol::{SystemCode, Uid, DEFAULT_BROADCAST_UID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const CONF_FILE_ENV: &str = "CONF_FILE";
pub const DEFAULT_CONF_FILE: &str = "./config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("exactly one master must be defined, found {0}")]
    MasterCount(usize),
    #[error("exactly one system must have `start: true`, found {0}")]
    StartCount(usize),
    #[error("system {node}: code '{code}' has an invalid UID '{uid}'")]
    InvalidUid { node: Endpoint, code: String, uid: String },
    #[error("system {node}: {source}")]
    Registry {
        node: Endpoint,
        #[source]
        source: RegistryError,
    },
    #[error("invalid broadcast UID '{0}'")]
    InvalidBroadcastUid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Master,
    Slave,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Master => f.write_str("master"),
            Profile::Slave => f.write_str("slave"),
        }
    }
}

/// Network address of a node's link server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub systems: Vec<SystemConf>,
    #[serde(default)]
    pub broadcast: BroadcastConf,
    #[serde(default)]
    pub serial: SerialConf,
    /// Secondes entre deux commandes `update_watchdog`.
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval: u64,
    #[serde(default)]
    pub logging: LoggingConf,
    #[serde(default)]
    pub link: LinkConf,
    pub api_server: Option<ApiServerConf>,
    pub dashboard: Option<DashboardConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConf {
    pub profile: Profile,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub start: bool,
    /// code système -> UID (8 chiffres hexa)
    #[serde(default)]
    pub system_codes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConf {
    pub uid: String,
}

impl Default for BroadcastConf {
    fn default() -> Self {
        Self { uid: DEFAULT_BROADCAST_UID.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConf {
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_ports_prefix")]
    pub ports_prefix: String,
    /// Numéros de série USB à ne jamais ouvrir (ex: scanner code-barres)
    #[serde(default)]
    pub excluded_serial_numbers: Vec<String>,
}

impl Default for SerialConf {
    fn default() -> Self {
        Self {
            baudrate: default_baudrate(),
            ports_prefix: default_ports_prefix(),
            excluded_serial_numbers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConf {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConf {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConf {
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_pacing")]
    pub probe_pacing_ms: u64,
}

impl Default for LinkConf {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay(),
            read_timeout_secs: default_read_timeout(),
            probe_interval_secs: default_probe_interval(),
            probe_pacing_ms: default_probe_pacing(),
        }
    }
}

impl LinkConf {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_pacing(&self) -> Duration {
        Duration::from_millis(self.probe_pacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiServerConf {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: String,
    pub licence_key: String,
}

impl ApiServerConf {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConf {
    #[serde(default = "default_dashboard_host")]
    pub host: String,
    pub port: u16,
}

fn default_watchdog_interval() -> u64 { 10 }
fn default_baudrate() -> u32 { 115_200 }
fn default_ports_prefix() -> String { "/dev/ttyACM".into() }
fn default_log_level() -> String { "info".into() }
fn default_retry_delay() -> u64 { 5 }
fn default_read_timeout() -> u64 { 15 }
fn default_probe_interval() -> u64 { 5 }
fn default_probe_pacing() -> u64 { 10 }
fn default_protocol() -> String { "https".into() }
fn default_dashboard_host() -> String { "0.0.0.0".into() }

/// Chemin du fichier de config : $CONF_FILE sinon ./config.yaml
pub fn config_path() -> PathBuf {
    std::env::var(CONF_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONF_FILE))
}

pub async fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&txt)
}

pub fn parse_config(txt: &str) -> Result<GatewayConfig, ConfigError> {
    Ok(serde_yaml::from_str(txt)?)
}

/// Rôle joué par ce processus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRole {
    Master,
    /// Index dans `IdentityRegistry::slaves`.
    Slave(usize),
}

impl LocalRole {
    pub fn profile(self) -> Profile {
        match self {
            LocalRole::Master => Profile::Master,
            LocalRole::Slave(_) => Profile::Slave,
        }
    }
}

/// Topologie validée, immuable pendant toute la vie du processus.
#[derive(Debug, Clone)]
pub struct Topology {
    pub local: LocalRole,
    pub identities: IdentityRegistry,
    pub broadcast_uid: Uid,
}

impl Topology {
    pub fn from_config(cfg: &GatewayConfig) -> Result<Self, ConfigError> {
        let masters = cfg.systems.iter().filter(|s| s.profile == Profile::Master).count();
        if masters != 1 {
            return Err(ConfigError::MasterCount(masters));
        }
        let starts = cfg.systems.iter().filter(|s| s.start).count();
        if starts != 1 {
            return Err(ConfigError::StartCount(starts));
        }

        let broadcast_uid: Uid = cfg
            .broadcast
            .uid
            .parse()
            .map_err(|_| ConfigError::InvalidBroadcastUid(cfg.broadcast.uid.clone()))?;

        let mut master = None;
        let mut slaves = Vec::new();
        let mut local = LocalRole::Master;

        for system in &cfg.systems {
            let node = build_node(system)?;
            match system.profile {
                Profile::Master => master = Some(node),
                Profile::Slave => {
                    if system.start {
                        local = LocalRole::Slave(slaves.len());
                    }
                    slaves.push(node);
                }
            }
        }

        let master = master.ok_or(ConfigError::MasterCount(0))?;
        Ok(Topology {
            local,
            identities: IdentityRegistry::new(master, slaves),
            broadcast_uid,
        })
    }

    pub fn profile(&self) -> Profile {
        self.local.profile()
    }

    /// Nœud démarré par ce processus.
    pub fn local_node(&self) -> &Node {
        match self.local {
            LocalRole::Master => &self.identities.master,
            LocalRole::Slave(index) => &self.identities.slaves[index],
        }
    }
}

fn build_node(system: &SystemConf) -> Result<Node, ConfigError> {
    let endpoint = Endpoint::new(system.ip.clone(), system.port);
    let mut pairs = Vec::with_capacity(system.system_codes.len());
    for (code, raw_uid) in &system.system_codes {
        let uid: Uid = raw_uid.parse().map_err(|_| ConfigError::InvalidUid {
            node: endpoint.clone(),
            code: code.clone(),
            uid: raw_uid.clone(),
        })?;
        pairs.push((SystemCode::new(code.as_str()), uid));
    }
    let registry = NodeRegistry::from_pairs(pairs).map_err(|source| ConfigError::Registry {
        node: endpoint.clone(),
        source,
    })?;
    Ok(Node { endpoint, registry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
systems:
  - profile: master
    ip: 10.0.0.1
    port: 9000
    start: true
    system_codes:
      T1: "C0C0C0C0"
      R1: "C0C0C0C1"
  - profile: slave
    ip: 10.0.0.2
    port: 9001
    system_codes:
      Z1: "AAAAAAAA"
  - profile: slave
    ip: 10.0.0.3
    port: 9002
    system_codes:
      Z2: "BBBBBBBB"
serial:
  baudrate: 9600
  ports_prefix: /dev/ttyUSB
api_server:
  host: api.example.org
  licence_key: LIC-1
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.systems.len(), 3);
        assert_eq!(cfg.serial.baudrate, 9600);
        assert_eq!(cfg.watchdog_interval, 10);
        assert_eq!(cfg.broadcast.uid, "FFFFFFFF");
        assert_eq!(cfg.link.retry_delay(), Duration::from_secs(5));
        assert_eq!(cfg.link.read_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.api_server.unwrap().base_url(), "https://api.example.org");
        assert!(cfg.dashboard.is_none());
    }

    #[test]
    fn topology_for_master_start() {
        let topo = Topology::from_config(&parse_config(SAMPLE).unwrap()).unwrap();
        assert_eq!(topo.local, LocalRole::Master);
        assert_eq!(topo.broadcast_uid, DEFAULT_BROADCAST_UID);
        assert_eq!(topo.identities.slaves.len(), 2);
        assert_eq!(topo.local_node().endpoint, Endpoint::new("10.0.0.1", 9000));
    }

    #[test]
    fn topology_for_slave_start() {
        let mut cfg = parse_config(SAMPLE).unwrap();
        cfg.systems[0].start = false;
        cfg.systems[2].start = true;
        let topo = Topology::from_config(&cfg).unwrap();
        assert_eq!(topo.local, LocalRole::Slave(1));
        assert_eq!(topo.profile(), Profile::Slave);
        assert_eq!(topo.local_node().endpoint.port, 9002);
    }

    #[test]
    fn rejects_master_count() {
        let mut cfg = parse_config(SAMPLE).unwrap();
        cfg.systems[1].profile = Profile::Master;
        assert!(matches!(Topology::from_config(&cfg), Err(ConfigError::MasterCount(2))));

        cfg.systems[0].profile = Profile::Slave;
        cfg.systems[1].profile = Profile::Slave;
        assert!(matches!(Topology::from_config(&cfg), Err(ConfigError::MasterCount(0))));
    }

    #[test]
    fn rejects_start_count_and_bad_uids() {
        let mut cfg = parse_config(SAMPLE).unwrap();
        cfg.systems[1].start = true;
        assert!(matches!(Topology::from_config(&cfg), Err(ConfigError::StartCount(2))));

        let mut cfg = parse_config(SAMPLE).unwrap();
        cfg.systems[1].system_codes.insert("Z9".into(), "XYZ".into());
        assert!(matches!(Topology::from_config(&cfg), Err(ConfigError::InvalidUid { .. })));

        let mut cfg = parse_config(SAMPLE).unwrap();
        cfg.systems[1].system_codes.insert("Z9".into(), "aaaaaaaa".into());
        assert!(matches!(
            Topology::from_config(&cfg),
            Err(ConfigError::Registry { source: RegistryError::DuplicateUid(_), .. })
        ));

        let mut cfg = parse_config(SAMPLE).unwrap();
        cfg.broadcast.uid = "nope".into();
        assert!(matches!(Topology::from_config(&cfg), Err(ConfigError::InvalidBroadcastUid(_))));
    }

    #[test]
    fn rejects_unknown_profile() {
        let bad = SAMPLE.replace("profile: slave\n    ip: 10.0.0.3", "profile: relay\n    ip: 10.0.0.3");
        assert!(matches!(parse_config(&bad), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn shipped_example_is_valid() {
        let cfg = parse_config(include_str!("../config.example.yaml")).unwrap();
        let topo = Topology::from_config(&cfg).unwrap();
        assert_eq!(topo.local, LocalRole::Master);
        assert_eq!(cfg.dashboard.unwrap().port, 8080);
    }

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = load_config(file.path()).await.unwrap();
        assert_eq!(cfg.systems[0].system_codes["T1"], "C0C0C0C0");

        let missing = load_config(Path::new("/definitely/not/here.yaml")).await;
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
