//! Identity types shared by the codec, the registries and the links.
//!
//! Three identity spaces meet in the gateway: the hardware UID burnt into each
//! microcontroller, the logical system code used by configuration and routing,
//! and the network endpoint of the node owning a code. Only the first two live
//! here; endpoints belong to the gateway.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hardware identifier of one microcontroller, rendered as 8 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid(u32);

/// Sentinel used when the configuration does not name a broadcast UID.
pub const DEFAULT_BROADCAST_UID: Uid = Uid(0xFFFF_FFFF);

impl Uid {
    pub const fn new(raw: u32) -> Self {
        Uid(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Uid(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid UID '{0}': expected 8 hex digits")]
pub struct InvalidUid(pub String);

impl FromStr for Uid {
    type Err = InvalidUid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 8 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidUid(s.to_string()));
        }
        u32::from_str_radix(trimmed, 16)
            .map(Uid)
            .map_err(|_| InvalidUid(s.to_string()))
    }
}

impl TryFrom<String> for Uid {
    type Error = InvalidUid;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Uid> for String {
    fn from(uid: Uid) -> Self {
        uid.to_string()
    }
}

/// Logical unit label (an environment zone) unique within one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemCode(String);

impl SystemCode {
    /// Code addressing every unit reachable from a node.
    pub const BROADCAST: &'static str = "broadcast";

    /// Letter carried by roof units. Roof units originate inter-zone
    /// commands and never receive forwarded ones.
    pub const ROOF_MARKER: char = 'T';

    pub fn new(code: impl Into<String>) -> Self {
        SystemCode(code.into())
    }

    pub fn broadcast() -> Self {
        SystemCode(Self::BROADCAST.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST
    }

    pub fn is_roof(&self) -> bool {
        self.0.contains(Self::ROOF_MARKER)
    }

    /// Routing correction for readings a unit takes on behalf of a
    /// neighbouring zone. Substitutions are applied one after the other,
    /// so `Up` then `Down` returns the original code for any code that
    /// does not already contain a `B`.
    pub fn shifted(&self, shift: Shift) -> SystemCode {
        let code = match shift {
            Shift::Up => self.0.replace('R', "B").replace('T', "R"),
            Shift::Down => self.0.replace('R', "T").replace('B', "R"),
        };
        SystemCode(code)
    }
}

impl fmt::Display for SystemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SystemCode {
    fn from(value: &str) -> Self {
        SystemCode::new(value)
    }
}

impl From<String> for SystemCode {
    fn from(value: String) -> Self {
        SystemCode(value)
    }
}

/// Shift rule declared by some Main catalog entries (`+1` / `-1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shift {
    Up,
    Down,
}

impl Shift {
    pub fn inverse(self) -> Shift {
        match self {
            Shift::Up => Shift::Down,
            Shift::Down => Shift::Up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_parses_and_renders_eight_hex_digits() {
        let uid: Uid = "c0c0c0c0".parse().unwrap();
        assert_eq!(uid.raw(), 0xC0C0_C0C0);
        assert_eq!(uid.to_string(), "C0C0C0C0");
        assert_eq!("0000002A".parse::<Uid>().unwrap(), Uid::new(42));
    }

    #[test]
    fn uid_rejects_bad_width_and_digits() {
        assert!("ABC".parse::<Uid>().is_err());
        assert!("AAAAAAAAA".parse::<Uid>().is_err());
        assert!("GGGGGGGG".parse::<Uid>().is_err());
        assert!("+AAAAAAA".parse::<Uid>().is_err());
    }

    #[test]
    fn uid_serde_uses_hex_string() {
        let uid = Uid::new(0xAAAA_AAAA);
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, "\"AAAAAAAA\"");
        let back: Uid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uid);
        assert!(serde_json::from_str::<Uid>("\"nope\"").is_err());
    }

    #[test]
    fn shift_up_rotates_labels() {
        let code = SystemCode::new("T1R");
        assert_eq!(code.shifted(Shift::Up).as_str(), "R1B");
        assert_eq!(SystemCode::new("T2").shifted(Shift::Up).as_str(), "R2");
        assert_eq!(SystemCode::new("R2").shifted(Shift::Up).as_str(), "B2");
    }

    #[test]
    fn shifts_are_mutual_inverses() {
        for raw in ["T1R", "T1", "R3", "Z1", "TR"] {
            let code = SystemCode::new(raw);
            let round = code.shifted(Shift::Up).shifted(Shift::Up.inverse());
            assert_eq!(round, code, "round trip failed for {raw}");
        }
    }

    #[test]
    fn roof_marker_and_broadcast() {
        assert!(SystemCode::new("T1").is_roof());
        assert!(!SystemCode::new("R1").is_roof());
        assert!(SystemCode::broadcast().is_broadcast());
    }
}
