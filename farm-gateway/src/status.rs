//! Liveness and last-value caches written by the ingestor, read by the dashboard.
//!
//! Both maps sit behind one mutex. Entries are overwritten, never removed;
//! staleness is computed when reading.

use crate::state::{new_shared, Shared};
use farm_protocol::{SystemCode, Uid};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use time::{Duration, OffsetDateTime};

/// A device not heard from for longer than this is reported failed.
pub const STALE_AFTER: Duration = Duration::seconds(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub system_code: SystemCode,
    pub last_check: OffsetDateTime,
    pub port: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Error")]
    Error,
    #[serde(rename = "Not detected")]
    NotDetected,
}

impl DeviceStatus {
    pub fn of(entry: Option<&StatusEntry>, now: OffsetDateTime) -> Self {
        match entry {
            None => DeviceStatus::NotDetected,
            Some(entry) if now - entry.last_check > STALE_AFTER => DeviceStatus::Error,
            Some(_) => DeviceStatus::Ok,
        }
    }
}

#[derive(Debug, Default)]
struct Board {
    entries: HashMap<Uid, StatusEntry>,
    last_values: HashMap<SystemCode, BTreeMap<String, u32>>,
}

#[derive(Clone)]
pub struct StatusBoard {
    inner: Shared<Board>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self { inner: new_shared(Board::default()) }
    }

    /// Marks `uid` as seen on `port`.
    pub fn touch(&self, uid: Uid, system_code: &SystemCode, port: &str, at: OffsetDateTime) {
        self.inner.lock().entries.insert(
            uid,
            StatusEntry {
                system_code: system_code.clone(),
                last_check: at,
                port: port.to_string(),
            },
        );
    }

    pub fn record_value(&self, system_code: &SystemCode, name: &str, value: u32) {
        self.inner
            .lock()
            .last_values
            .entry(system_code.clone())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn entry(&self, uid: Uid) -> Option<StatusEntry> {
        self.inner.lock().entries.get(&uid).cloned()
    }

    pub fn last_values(&self, system_code: &SystemCode) -> BTreeMap<String, u32> {
        self.inner
            .lock()
            .last_values
            .get(system_code)
            .cloned()
            .unwrap_or_default()
    }

    pub fn status(&self, uid: Uid, now: OffsetDateTime) -> DeviceStatus {
        DeviceStatus::of(self.inner.lock().entries.get(&uid), now)
    }

    /// Every device seen so far, sorted by UID.
    pub fn seen_devices(&self) -> Vec<(Uid, StatusEntry)> {
        let board = self.inner.lock();
        let mut seen: Vec<(Uid, StatusEntry)> =
            board.entries.iter().map(|(uid, entry)| (*uid, entry.clone())).collect();
        seen.sort_by_key(|(uid, _)| *uid);
        seen
    }
}
