//! Identity registry: hardware UID <-> system code, and system code -> owning slave.
//!
//! Built once from the validated topology, never mutated afterwards.

use crate::config::{Endpoint, Profile};
use farm_protocol::{SystemCode, Uid};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown UID {0}")]
    UnknownUid(Uid),
    #[error("no slave owns system code '{0}'")]
    UnknownSystemCode(SystemCode),
    #[error("UID {0} is bound to more than one system code")]
    DuplicateUid(Uid),
}

/// Bidirectional UID <-> code map of a single node.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    by_code: BTreeMap<SystemCode, Uid>,
    by_uid: HashMap<Uid, SystemCode>,
}

impl NodeRegistry {
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (SystemCode, Uid)>,
    ) -> Result<Self, RegistryError> {
        let mut registry = NodeRegistry::default();
        for (code, uid) in pairs {
            if registry.by_uid.insert(uid, code.clone()).is_some() {
                return Err(RegistryError::DuplicateUid(uid));
            }
            registry.by_code.insert(code, uid);
        }
        Ok(registry)
    }

    pub fn uid_of(&self, code: &SystemCode) -> Option<Uid> {
        self.by_code.get(code).copied()
    }

    pub fn code_of(&self, uid: Uid) -> Option<&SystemCode> {
        self.by_uid.get(&uid)
    }

    pub fn contains_code(&self, code: &SystemCode) -> bool {
        self.by_code.contains_key(code)
    }

    /// Pairs sorted by system code.
    pub fn iter(&self) -> impl Iterator<Item = (&SystemCode, Uid)> {
        self.by_code.iter().map(|(code, uid)| (code, *uid))
    }

    pub fn codes(&self) -> impl Iterator<Item = &SystemCode> {
        self.by_code.keys()
    }
}

/// One configured node: its link server address and its hardware.
#[derive(Debug, Clone)]
pub struct Node {
    pub endpoint: Endpoint,
    pub registry: NodeRegistry,
}

/// Slave owning a system code, as seen from the master.
#[derive(Debug, Clone, Copy)]
pub struct SlaveRef<'a> {
    pub index: usize,
    pub node: &'a Node,
}

#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    pub master: Node,
    pub slaves: Vec<Node>,
}

impl IdentityRegistry {
    pub fn new(master: Node, slaves: Vec<Node>) -> Self {
        Self { master, slaves }
    }

    /// Code under which a frame from `uid` is recorded.
    ///
    /// A master only knows its own hardware. A slave scans every slave
    /// registry, its own included.
    pub fn resolve_system_code(&self, profile: Profile, uid: Uid) -> Result<SystemCode, RegistryError> {
        let found = match profile {
            Profile::Master => self.master.registry.code_of(uid),
            Profile::Slave => self.slaves.iter().find_map(|slave| slave.registry.code_of(uid)),
        };
        found.cloned().ok_or(RegistryError::UnknownUid(uid))
    }

    /// Slave whose registry contains `code`. The first match wins.
    pub fn resolve_client(&self, code: &SystemCode) -> Result<SlaveRef<'_>, RegistryError> {
        self.slaves
            .iter()
            .enumerate()
            .find(|(_, slave)| slave.registry.contains_code(code))
            .map(|(index, node)| SlaveRef { index, node })
            .ok_or_else(|| RegistryError::UnknownSystemCode(code.clone()))
    }

    /// Every known device, for the dashboard.
    pub fn all_devices(&self) -> impl Iterator<Item = (&SystemCode, Uid)> {
        std::iter::once(&self.master)
            .chain(self.slaves.iter())
            .flat_map(|node| node.registry.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16, pairs: &[(&str, u32)]) -> Node {
        Node {
            endpoint: Endpoint::new("127.0.0.1", port),
            registry: NodeRegistry::from_pairs(
                pairs.iter().map(|(code, uid)| (SystemCode::new(*code), Uid::new(*uid))),
            )
            .unwrap(),
        }
    }

    fn sample() -> IdentityRegistry {
        IdentityRegistry::new(
            node(9000, &[("T1", 0xC0C0_C0C0)]),
            vec![
                node(9001, &[("Z1", 0xAAAA_AAAA)]),
                node(9002, &[("Z2", 0xBBBB_BBBB), ("Z3", 0xBBBB_BBBC)]),
            ],
        )
    }

    #[test]
    fn master_resolves_only_its_own_hardware() {
        let reg = sample();
        assert_eq!(
            reg.resolve_system_code(Profile::Master, Uid::new(0xC0C0_C0C0)).unwrap().as_str(),
            "T1"
        );
        assert_eq!(
            reg.resolve_system_code(Profile::Master, Uid::new(0xAAAA_AAAA)),
            Err(RegistryError::UnknownUid(Uid::new(0xAAAA_AAAA)))
        );
    }

    #[test]
    fn slave_scans_every_slave_registry() {
        let reg = sample();
        assert_eq!(
            reg.resolve_system_code(Profile::Slave, Uid::new(0xBBBB_BBBC)).unwrap().as_str(),
            "Z3"
        );
        assert!(reg.resolve_system_code(Profile::Slave, Uid::new(0xC0C0_C0C0)).is_err());
    }

    #[test]
    fn resolve_client_finds_owner() {
        let reg = sample();
        let owner = reg.resolve_client(&SystemCode::new("Z2")).unwrap();
        assert_eq!(owner.index, 1);
        assert_eq!(owner.node.endpoint.port, 9002);
        assert_eq!(
            reg.resolve_client(&SystemCode::new("T1")).unwrap_err(),
            RegistryError::UnknownSystemCode(SystemCode::new("T1"))
        );
    }

    #[test]
    fn duplicate_uid_is_rejected() {
        let err = NodeRegistry::from_pairs([
            (SystemCode::new("A"), Uid::new(1)),
            (SystemCode::new("B"), Uid::new(1)),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateUid(Uid::new(1)));
    }

    #[test]
    fn all_devices_lists_master_then_slaves() {
        let codes: Vec<String> = sample().all_devices().map(|(c, _)| c.to_string()).collect();
        assert_eq!(codes, vec!["T1", "Z1", "Z2", "Z3"]);
    }
}
