//! Binary codec for the serial frames exchanged with the microcontrollers.
//!
//! ```text
//! ┌──────┬─────────┬──────────────┬──────────┬──────────────────────┬────────┐
//! │ type │ version │ length (u16) │ UID (4)  │ items ... zero pad   │ term.  │
//! │ 0x01 │  0x01   │  big-endian  │          │ kind|sub|len u16|val │ (wire) │
//! └──────┴─────────┴──────────────┴──────────┴──────────────────────┴────────┘
//!   1 B     1 B         2 B           4 B            12 B               1 B
//! ```
//!
//! The length field counts the bytes after itself, UID included. Outbound
//! frames are 20 bytes; inbound wire chunks carry one extra terminator byte
//! which [`split_wire_chunks`] strips before decoding.

use crate::catalog::{self, CommandSpec, DataClass, DataSpec, ItemKind};
use crate::identity::{Shift, SystemCode, Uid};

/// Size of one encoded frame, terminator excluded.
pub const FRAME_LEN: usize = 20;
/// Size of one window on the serial wire, terminator included.
pub const WIRE_CHUNK_LEN: usize = FRAME_LEN + 1;
pub const FRAME_TYPE: u8 = 0x01;
pub const PROTOCOL_VERSION: u8 = 0x01;
pub const TERMINATOR: u8 = 0xFF;

const LENGTH_OFFSET: usize = 2;
const UID_OFFSET: usize = 4;
const HEADER_LEN: usize = 8;
const ITEM_HEADER_LEN: usize = 4;
const MAX_VALUE_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("value {value} outside {domain} for '{action}'")]
    ValueOutOfDomain {
        action: String,
        value: i64,
        domain: String,
    },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown {kind} subtype {subtype}")]
    UnknownSubtype { kind: ItemKind, subtype: u8 },
    #[error("unknown item kind {0:#04x}")]
    UnknownKind(u8),
    #[error("frame overflow: item needs {needed} bytes, {available} left")]
    FrameOverflow { needed: usize, available: usize },
}

/// Main (telemetry) reading together with its catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainItem {
    pub entry: &'static DataSpec,
    pub value: u32,
}

impl MainItem {
    pub fn name(&self) -> &'static str {
        self.entry.name
    }

    pub fn class(&self) -> DataClass {
        self.entry.class
    }

    /// System code the reading must be recorded against.
    pub fn routing_code(&self, sender: &SystemCode) -> SystemCode {
        match self.entry.shift {
            Some(shift) => sender.shifted(shift),
            None => sender.clone(),
        }
    }

    pub fn shift(&self) -> Option<Shift> {
        self.entry.shift
    }
}

/// One typed sub-message inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Internal { subtype: u8, name: &'static str, value: u32 },
    Command { subtype: u8, name: &'static str, value: u32 },
    Main(MainItem),
    Secondary { subtype: u8, name: &'static str, value: u32 },
    Error { subtype: u8, name: &'static str },
    Information { subtype: u8, name: &'static str, value: u32 },
}

impl Item {
    pub fn kind(&self) -> ItemKind {
        match self {
            Item::Internal { .. } => ItemKind::Internal,
            Item::Command { .. } => ItemKind::Command,
            Item::Main(_) => ItemKind::Main,
            Item::Secondary { .. } => ItemKind::Secondary,
            Item::Error { .. } => ItemKind::Error,
            Item::Information { .. } => ItemKind::Information,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Item::Internal { name, .. }
            | Item::Command { name, .. }
            | Item::Secondary { name, .. }
            | Item::Error { name, .. }
            | Item::Information { name, .. } => name,
            Item::Main(main) => main.name(),
        }
    }

    pub fn value(&self) -> Option<u32> {
        match self {
            Item::Internal { value, .. }
            | Item::Command { value, .. }
            | Item::Secondary { value, .. }
            | Item::Information { value, .. } => Some(*value),
            Item::Main(main) => Some(main.value),
            Item::Error { .. } => None,
        }
    }
}

/// Item skipped while decoding, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    pub raw: Vec<u8>,
    pub reason: CodecError,
}

/// One decoded unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub uid: Uid,
    pub items: Vec<Item>,
    pub rejected: Vec<RejectedItem>,
}

/// Command ready for the serial writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    pub uid: Uid,
    pub action: &'static str,
    pub value: u32,
    pub bytes: Vec<u8>,
    pub hex: String,
}

/// Incremental frame encoder. Accepts raw kind/subtype bytes so that test
/// tooling can produce frames outside the catalog.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new(uid: Uid) -> Self {
        let mut buf = Vec::with_capacity(FRAME_LEN);
        buf.push(FRAME_TYPE);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&((FRAME_LEN - UID_OFFSET) as u16).to_be_bytes());
        buf.extend_from_slice(&uid.to_be_bytes());
        FrameWriter { buf }
    }

    pub fn push(&mut self, kind: u8, subtype: u8, value: u32) -> Result<&mut Self, CodecError> {
        let value_bytes = minimal_be_bytes(value);
        let needed = ITEM_HEADER_LEN + value_bytes.len();
        let available = FRAME_LEN - self.buf.len();
        if needed > available {
            return Err(CodecError::FrameOverflow { needed, available });
        }
        self.buf.push(kind);
        self.buf.push(subtype);
        self.buf.extend_from_slice(&(value_bytes.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(&value_bytes);
        Ok(self)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.resize(FRAME_LEN, 0);
        self.buf
    }
}

fn minimal_be_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(MAX_VALUE_LEN - 1);
    bytes[first..].to_vec()
}

/// Catalog entry of `action`, provided `value` is admissible for it.
pub fn check_command(action: &str, value: i64) -> Result<&'static CommandSpec, CodecError> {
    let entry = catalog::command_by_name(action)
        .ok_or_else(|| CodecError::UnknownAction(action.to_string()))?;
    if !entry.domain.contains(value) {
        return Err(CodecError::ValueOutOfDomain {
            action: action.to_string(),
            value,
            domain: entry.domain.to_string(),
        });
    }
    Ok(entry)
}

/// Encodes a command for `uid` after checking it against the catalog.
pub fn encode_command(uid: Uid, action: &str, value: i64) -> Result<EncodedCommand, CodecError> {
    let entry = check_command(action, value)?;
    // the domain check guarantees the value fits in u32
    let value = value as u32;

    let mut writer = FrameWriter::new(uid);
    writer.push(ItemKind::Command.as_byte(), entry.subtype, value)?;
    let bytes = writer.finish();
    let hex = hex_string(&bytes);

    Ok(EncodedCommand {
        uid,
        action: entry.name,
        value,
        bytes,
        hex,
    })
}

/// Decodes one terminator-less chunk.
///
/// Structural damage fails the whole chunk. Items that are well formed but
/// not in the catalog are skipped and listed in [`Frame::rejected`].
pub fn decode(chunk: &[u8]) -> Result<Frame, CodecError> {
    if chunk.len() < HEADER_LEN {
        return Err(CodecError::MalformedFrame(format!(
            "{} bytes is shorter than the {HEADER_LEN}-byte header",
            chunk.len()
        )));
    }

    let declared = u16::from_be_bytes([chunk[LENGTH_OFFSET], chunk[LENGTH_OFFSET + 1]]) as usize;
    let body_end = UID_OFFSET + declared;
    if body_end < HEADER_LEN || body_end > chunk.len() {
        return Err(CodecError::MalformedFrame(format!(
            "declared length {declared} does not fit a {}-byte chunk",
            chunk.len()
        )));
    }

    let uid = Uid::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
    let mut items = Vec::new();
    let mut rejected = Vec::new();
    let mut cursor = HEADER_LEN;

    while cursor < body_end {
        let rest = &chunk[cursor..body_end];
        if rest.iter().all(|b| *b == 0) {
            break;
        }
        if rest.len() < ITEM_HEADER_LEN {
            return Err(CodecError::MalformedFrame(format!(
                "truncated item header at offset {cursor}"
            )));
        }

        let kind = rest[0];
        let subtype = rest[1];
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if len > MAX_VALUE_LEN {
            return Err(CodecError::MalformedFrame(format!(
                "item at offset {cursor} declares a {len}-byte value"
            )));
        }
        if rest.len() < ITEM_HEADER_LEN + len {
            return Err(CodecError::MalformedFrame(format!(
                "truncated item value at offset {cursor}"
            )));
        }

        let value = rest[ITEM_HEADER_LEN..ITEM_HEADER_LEN + len]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        let raw = rest[..ITEM_HEADER_LEN + len].to_vec();
        cursor += ITEM_HEADER_LEN + len;

        match interpret(kind, subtype, value) {
            Ok(item) => items.push(item),
            Err(reason) => rejected.push(RejectedItem { raw, reason }),
        }
    }

    Ok(Frame { uid, items, rejected })
}

fn interpret(kind: u8, subtype: u8, value: u32) -> Result<Item, CodecError> {
    let kind = ItemKind::from_byte(kind).ok_or(CodecError::UnknownKind(kind))?;
    let unknown = || CodecError::UnknownSubtype { kind, subtype };

    match kind {
        ItemKind::Command => {
            let entry = catalog::command_by_subtype(subtype).ok_or_else(unknown)?;
            if !entry.domain.contains(i64::from(value)) {
                return Err(CodecError::ValueOutOfDomain {
                    action: entry.name.to_string(),
                    value: i64::from(value),
                    domain: entry.domain.to_string(),
                });
            }
            Ok(Item::Command { subtype, name: entry.name, value })
        }
        ItemKind::Main => {
            let entry = catalog::main_by_subtype(subtype).ok_or_else(unknown)?;
            Ok(Item::Main(MainItem { entry, value }))
        }
        ItemKind::Internal => {
            let entry = catalog::named_by_subtype(kind, subtype).ok_or_else(unknown)?;
            Ok(Item::Internal { subtype, name: entry.name, value })
        }
        ItemKind::Secondary => {
            let entry = catalog::named_by_subtype(kind, subtype).ok_or_else(unknown)?;
            Ok(Item::Secondary { subtype, name: entry.name, value })
        }
        ItemKind::Error => {
            let entry = catalog::named_by_subtype(kind, subtype).ok_or_else(unknown)?;
            Ok(Item::Error { subtype, name: entry.name })
        }
        ItemKind::Information => {
            let entry = catalog::named_by_subtype(kind, subtype).ok_or_else(unknown)?;
            Ok(Item::Information { subtype, name: entry.name, value })
        }
    }
}

/// Splits a raw serial buffer into fixed windows, drops the terminator byte
/// of each and skips windows left empty.
pub fn split_wire_chunks(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    raw.chunks(WIRE_CHUNK_LEN)
        .map(|window| &window[..window.len() - 1])
        .filter(|chunk| !chunk.is_empty())
}

/// Appends the terminator byte, producing one wire window.
pub fn to_wire(frame: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(frame.len() + 1);
    wire.extend_from_slice(frame);
    wire.push(TERMINATOR);
    wire
}

/// Lower-case hex rendering, two digits per byte (40 digits for a frame).
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
