//! Closed catalog of every item kind and subtype the microcontrollers speak.
//!
//! The tables are the single source of truth for names, admissible command
//! values, persistence classes and shift rules. Lookups are linear: the
//! tables are tiny and never change at runtime.

use crate::identity::Shift;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind byte at the start of every item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ItemKind {
    Internal = 0,
    Command = 1,
    Main = 2,
    Secondary = 3,
    Error = 4,
    Information = 5,
}

impl ItemKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ItemKind::Internal),
            1 => Some(ItemKind::Command),
            2 => Some(ItemKind::Main),
            3 => Some(ItemKind::Secondary),
            4 => Some(ItemKind::Error),
            5 => Some(ItemKind::Information),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemKind::Internal => "internal",
            ItemKind::Command => "command",
            ItemKind::Main => "main",
            ItemKind::Secondary => "secondary",
            ItemKind::Error => "error",
            ItemKind::Information => "information",
        };
        f.write_str(name)
    }
}

/// Admissible integer values of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Explicit set, e.g. `{0, 1}`.
    OneOf(&'static [u32]),
    /// Inclusive range, e.g. `[0, 100]`.
    Range(u32, u32),
}

impl Domain {
    pub fn contains(&self, value: i64) -> bool {
        let Ok(value) = u32::try_from(value) else {
            return false;
        };
        match self {
            Domain::OneOf(values) => values.contains(&value),
            Domain::Range(low, high) => (*low..=*high).contains(&value),
        }
    }

    /// Every admissible value, in increasing order.
    pub fn values(&self) -> Vec<u32> {
        match self {
            Domain::OneOf(values) => values.to_vec(),
            Domain::Range(low, high) => (*low..=*high).collect(),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::OneOf(values) => {
                let list: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{{{}}}", list.join(","))
            }
            Domain::Range(low, high) => write!(f, "[{low},{high}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub subtype: u8,
    pub name: &'static str,
    pub domain: Domain,
}

/// Persistence class consumed by the telemetry writer downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataClass {
    #[serde(rename = "default_data_persister")]
    Default,
    #[serde(rename = "temperature_data_persister")]
    Temperature,
    #[serde(rename = "door_closed_data_persister")]
    DoorClosed,
    #[serde(rename = "current_data_persister")]
    Current,
}

impl DataClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DataClass::Default => "default_data_persister",
            DataClass::Temperature => "temperature_data_persister",
            DataClass::DoorClosed => "door_closed_data_persister",
            DataClass::Current => "current_data_persister",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSpec {
    pub subtype: u8,
    pub name: &'static str,
    pub class: DataClass,
    pub shift: Option<Shift>,
}

/// Name-only entry (internal, secondary, error and information kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedSpec {
    pub subtype: u8,
    pub name: &'static str,
}

const ON_OFF: Domain = Domain::OneOf(&[0, 1]);
const ONLY_ONE: Domain = Domain::OneOf(&[1]);

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec { subtype: 0, name: "ack", domain: ON_OFF },
    CommandSpec { subtype: 1, name: "update_watchdog", domain: ONLY_ONE },
    CommandSpec { subtype: 2, name: "force_reset", domain: ONLY_ONE },
    CommandSpec { subtype: 3, name: "air_extraction", domain: Domain::Range(0, 100) },
    CommandSpec { subtype: 4, name: "temperature", domain: Domain::Range(0, 100) },
    CommandSpec { subtype: 5, name: "led_color", domain: Domain::Range(0, 17) },
    CommandSpec { subtype: 6, name: "on_off", domain: ON_OFF },
    CommandSpec { subtype: 7, name: "door_closed", domain: ON_OFF },
    CommandSpec { subtype: 10, name: "relay_off", domain: ON_OFF },
    CommandSpec { subtype: 11, name: "tare", domain: ONLY_ONE },
    CommandSpec { subtype: 12, name: "get_weight", domain: ONLY_ONE },
    CommandSpec { subtype: 14, name: "dehumidifier_on", domain: ON_OFF },
    CommandSpec { subtype: 15, name: "sm_volume", domain: Domain::Range(0, 30) },
    CommandSpec { subtype: 16, name: "sm_eq", domain: Domain::Range(0, 5) },
    CommandSpec { subtype: 17, name: "sm_track", domain: Domain::Range(0, 5) },
    CommandSpec { subtype: 18, name: "sm_repeat", domain: ON_OFF },
    CommandSpec { subtype: 19, name: "sm_simple_cmd", domain: Domain::OneOf(&[1, 2, 3, 4, 5]) },
];

const fn data(subtype: u8, name: &'static str, class: DataClass) -> DataSpec {
    DataSpec { subtype, name, class, shift: None }
}

// `_ext` readings are taken by a roof unit for the zone beneath it.
const fn ext(subtype: u8, name: &'static str, class: DataClass) -> DataSpec {
    DataSpec { subtype, name, class, shift: Some(Shift::Up) }
}

pub const MAIN_DATA: &[DataSpec] = &[
    data(0, "led_color", DataClass::Default),
    data(1, "relay_on", DataClass::Default),
    data(2, "humidity", DataClass::Default),
    data(3, "temperature", DataClass::Temperature),
    ext(4, "humidity_ext", DataClass::Default),
    ext(5, "temperature_ext", DataClass::Temperature),
    data(6, "pm1", DataClass::Default),
    data(7, "pm2_5", DataClass::Default),
    data(8, "pm4", DataClass::Default),
    data(9, "pm10", DataClass::Default),
    data(10, "voc_index", DataClass::Default),
    data(11, "nox_index", DataClass::Default),
    ext(12, "pm1_ext", DataClass::Default),
    ext(13, "pm2_5_ext", DataClass::Default),
    ext(14, "pm4_ext", DataClass::Default),
    ext(15, "pm10_ext", DataClass::Default),
    ext(16, "voc_index_ext", DataClass::Default),
    ext(17, "nox_index_ext", DataClass::Default),
    data(18, "weight", DataClass::Default),
    data(19, "pressure", DataClass::Default),
    data(20, "door_closed", DataClass::DoorClosed),
    data(21, "embedded_electronics_current", DataClass::Current),
    data(22, "electric_plug_current", DataClass::Current),
];

pub const INTERNAL: &[NamedSpec] = &[
    NamedSpec { subtype: 0, name: "ack_general" },
    NamedSpec { subtype: 1, name: "ack_command" },
    NamedSpec { subtype: 5, name: "ack_information" },
];

pub const SECONDARY: &[NamedSpec] = &[
    NamedSpec { subtype: 0, name: "tachy_extraction" },
    NamedSpec { subtype: 1, name: "ee_temperature" },
];

pub const ERRORS: &[NamedSpec] = &[
    NamedSpec { subtype: 0, name: "left_latch" },
    NamedSpec { subtype: 1, name: "right_latch" },
    NamedSpec { subtype: 2, name: "i2c_smart_power" },
    NamedSpec { subtype: 3, name: "i2c_smart_sensor_1" },
    NamedSpec { subtype: 4, name: "i2c_smart_sensor_2" },
];

pub const INFORMATION: &[NamedSpec] = &[NamedSpec { subtype: 0, name: "ack" }];

pub fn command_by_name(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|entry| entry.name == name)
}

pub fn command_by_subtype(subtype: u8) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|entry| entry.subtype == subtype)
}

pub fn main_by_subtype(subtype: u8) -> Option<&'static DataSpec> {
    MAIN_DATA.iter().find(|entry| entry.subtype == subtype)
}

pub fn main_by_name(name: &str) -> Option<&'static DataSpec> {
    MAIN_DATA.iter().find(|entry| entry.name == name)
}

/// Name table for the kinds that carry no extra metadata.
pub fn named_table(kind: ItemKind) -> &'static [NamedSpec] {
    match kind {
        ItemKind::Internal => INTERNAL,
        ItemKind::Secondary => SECONDARY,
        ItemKind::Error => ERRORS,
        ItemKind::Information => INFORMATION,
        ItemKind::Command | ItemKind::Main => &[],
    }
}

pub fn named_by_subtype(kind: ItemKind, subtype: u8) -> Option<&'static NamedSpec> {
    named_table(kind).iter().find(|entry| entry.subtype == subtype)
}
