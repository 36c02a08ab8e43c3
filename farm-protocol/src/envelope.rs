//! Versioned envelope exchanged between master and slave nodes.
//!
//! On the socket every envelope is a 4-byte big-endian length followed by a
//! JSON object `{"v": 1, "type": ..., ...}`. Anything that does not parse
//! against this schema is rejected, never interpreted.

use crate::catalog::DataClass;
use crate::identity::SystemCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ENVELOPE_VERSION: u64 = 1;
/// Largest JSON body accepted on a link.
pub const MAX_ENVELOPE_LEN: usize = 1024 * 1024;
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope has no version field")]
    MissingVersion,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u64),
    #[error("envelope of {len} bytes exceeds the {max}-byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Command addressed to one system code (or `broadcast`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub system_code: SystemCode,
    pub action: String,
    pub data: i64,
}

/// Latest reading of one data name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    pub value: u32,
    pub class: DataClass,
}

/// Readings grouped `system_code -> data name -> point`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryBatch(BTreeMap<SystemCode, BTreeMap<String, DataPoint>>);

impl TelemetryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a reading, replacing any earlier one for the same key.
    pub fn record(&mut self, code: SystemCode, name: impl Into<String>, point: DataPoint) {
        self.0.entry(code).or_default().insert(name.into(), point);
    }

    pub fn get(&self, code: &SystemCode, name: &str) -> Option<&DataPoint> {
        self.0.get(code).and_then(|values| values.get(name))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of system codes carried.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn system_codes(&self) -> impl Iterator<Item = &SystemCode> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SystemCode, &BTreeMap<String, DataPoint>)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Liveness probe. Acknowledged by the receiver, never dispatched.
    CheckMessage,
    Command(CommandEnvelope),
    Telemetry { batch: TelemetryBatch },
}

impl Envelope {
    pub fn command(system_code: SystemCode, action: impl Into<String>, data: i64) -> Self {
        Envelope::Command(CommandEnvelope {
            system_code,
            action: action.into(),
            data,
        })
    }

    pub fn telemetry(batch: TelemetryBatch) -> Self {
        Envelope::Telemetry { batch }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::CheckMessage => "check_message",
            Envelope::Command(_) => "command",
            Envelope::Telemetry { .. } => "telemetry",
        }
    }

    /// JSON body carrying the version field.
    pub fn to_json(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("v".into(), ENVELOPE_VERSION.into());
        }
        let body = serde_json::to_vec(&value)?;
        check_len(body.len())?;
        Ok(body)
    }

    pub fn from_json(body: &[u8]) -> Result<Self, EnvelopeError> {
        check_len(body.len())?;
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let version = value
            .get("v")
            .and_then(serde_json::Value::as_u64)
            .ok_or(EnvelopeError::MissingVersion)?;
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Length-prefixed body, ready for the socket.
    pub fn to_frame(&self) -> Result<Vec<u8>, EnvelopeError> {
        let body = self.to_json()?;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Validates a length prefix read from the socket.
pub fn check_len(len: usize) -> Result<usize, EnvelopeError> {
    if len > MAX_ENVELOPE_LEN {
        return Err(EnvelopeError::TooLarge {
            len,
            max: MAX_ENVELOPE_LEN,
        });
    }
    Ok(len)
}
