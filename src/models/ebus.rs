//! Device state as exposed by the ebus gateway daemon.
//!
//! Notes
//! - Named values are the identifiers ebusd knows; zone values carry a `z<index>` prefix.
//! - Enum fields are `Option` because a fresh snapshot has not seen any daemon answer yet.

use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =====================
// Named values
// =====================

pub const STATUS_TIME: &str = "vdatetime";
pub const STATUS_OUTSIDE_TEMP: &str = "outsidetemp";
pub const STATUS_SYSTEM_FLOW_TEMP: &str = "SystemFlowTemp";
pub const STATUS_WATER_PRESSURE: &str = "WaterPressure";
pub const STATUS_CURRENT_CONSUMED_POWER: &str = "CurrentConsumedPower";
pub const STATUS_STATUS01: &str = "Status01";
pub const STATUS_STATE: &str = "State";

pub const HOTWATER_OP_MODE: &str = "HwcOpMode";
pub const HOTWATER_TEMP_DESIRED: &str = "HwcTempDesired";
pub const HOTWATER_STORAGE_TEMP: &str = "HwcStorageTemp";
pub const HOTWATER_SF_MODE: &str = "HwcSFMode";

// Zone values, prefixed with `z<index>`.
pub const ZONE_OP_MODE: &str = "OpMode";
pub const ZONE_SF_MODE: &str = "SFMode";
pub const ZONE_ROOM_TEMP_DESIRED: &str = "ActualRoomTempDesired";
pub const ZONE_ROOM_TEMP: &str = "RoomTemp";
pub const ZONE_QUICK_VETO_TEMP: &str = "QuickVetoTemp";
pub const ZONE_QUICK_VETO_END_DATE: &str = "QuickVetoEndDate";
pub const ZONE_QUICK_VETO_END_TIME: &str = "QuickVetoEndTime";
pub const ZONE_QUICK_VETO_DURATION: &str = "QuickVetoDuration";
pub const ZONE_SHORT_NAME: &str = "Shortname";
pub const ZONE_NAME1: &str = "Name1";
pub const ZONE_NAME2: &str = "Name2";

pub const HOTWATER_VALUES: [&str; 4] = [HOTWATER_OP_MODE, HOTWATER_TEMP_DESIRED, HOTWATER_STORAGE_TEMP, HOTWATER_SF_MODE];

pub const STATUS_VALUES: [&str; 7] = [
    STATUS_TIME,
    STATUS_OUTSIDE_TEMP,
    STATUS_SYSTEM_FLOW_TEMP,
    STATUS_WATER_PRESSURE,
    STATUS_CURRENT_CONSUMED_POWER,
    STATUS_STATUS01,
    STATUS_STATE,
];

pub const ZONE_VALUES: [&str; 11] = [
    ZONE_OP_MODE,
    ZONE_SF_MODE,
    ZONE_ROOM_TEMP_DESIRED,
    ZONE_ROOM_TEMP,
    ZONE_QUICK_VETO_TEMP,
    ZONE_QUICK_VETO_END_TIME,
    ZONE_QUICK_VETO_END_DATE,
    ZONE_QUICK_VETO_DURATION,
    ZONE_NAME1,
    ZONE_NAME2,
    ZONE_SHORT_NAME,
];

/// Number of heating zones read in the reference installation.
pub const DEFAULT_ZONE_COUNT: u8 = 3;
/// Zone used when a caller does not name one.
pub const DEFAULT_ZONE_INDEX: u8 = 0;
pub const DEFAULT_VETO_SETPOINT: f64 = 20.0;
pub const DEFAULT_VETO_DURATION_HOURS: f64 = 0.5;

/// Full daemon name of a zone value, e.g. `z1OpMode`.
pub fn zone_value(index: u8, value: &str) -> String {
    format!("z{}{}", index, value)
}

// =====================
// Enums (daemon words)
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Off,
    Auto,
    Day,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HotwaterSpecialFunction {
    #[serde(rename = "load")]
    Boost,
    #[serde(rename = "auto")]
    Normal,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneSpecialFunction {
    Auto,
    Veto,
}

/// Raised when the daemon answers with a word outside an enum's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownWord(pub String);

impl fmt::Display for UnknownWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value '{}'", self.0)
    }
}

impl std::error::Error for UnknownWord {}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::Off => "off",
            OperationMode::Auto => "auto",
            OperationMode::Day => "day",
        }
    }
}

impl FromStr for OperationMode {
    type Err = UnknownWord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(OperationMode::Off),
            "auto" => Ok(OperationMode::Auto),
            "day" => Ok(OperationMode::Day),
            other => Err(UnknownWord(other.to_string())),
        }
    }
}

impl HotwaterSpecialFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            HotwaterSpecialFunction::Boost => "load",
            HotwaterSpecialFunction::Normal => "auto",
        }
    }
}

impl FromStr for HotwaterSpecialFunction {
    type Err = UnknownWord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "load" => Ok(HotwaterSpecialFunction::Boost),
            "auto" => Ok(HotwaterSpecialFunction::Normal),
            other => Err(UnknownWord(other.to_string())),
        }
    }
}

impl ZoneSpecialFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            ZoneSpecialFunction::Auto => "auto",
            ZoneSpecialFunction::Veto => "veto",
        }
    }
}

impl FromStr for ZoneSpecialFunction {
    type Err = UnknownWord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ZoneSpecialFunction::Auto),
            "veto" => Ok(ZoneSpecialFunction::Veto),
            other => Err(UnknownWord(other.to_string())),
        }
    }
}

// =====================
// Snapshot
// =====================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub time: String,
    pub outside_temperature: f64,
    pub system_flow_temperature: f64,
    pub water_pressure: f64,
    /// kW
    pub current_consumed_power: f64,
    pub status01: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hotwater {
    pub temp_desired: f64,
    pub storage_temp: f64,
    pub operation_mode: Option<OperationMode>,
    pub special_function: Option<HotwaterSpecialFunction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRecord {
    /// 1-based; determines the `z<index>` prefix.
    pub index: u8,
    pub operation_mode: Option<OperationMode>,
    pub special_function: Option<ZoneSpecialFunction>,
    pub room_temp_desired: f64,
    pub room_temp: f64,
    pub quick_veto_temp: f64,
    pub quick_veto_end_date: String,
    pub quick_veto_end_time: String,
    pub short_name: String,
    pub name1: String,
    pub name2: String,
}

impl ZoneRecord {
    pub fn new(index: u8) -> Self {
        ZoneRecord {
            index,
            ..Default::default()
        }
    }

    /// Display name assembled from the two name parts, falling back to the short name.
    pub fn display_name(&self) -> String {
        let joined = format!("{}{}", self.name1, self.name2);
        if joined.trim().is_empty() {
            self.short_name.clone()
        } else {
            joined
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub status: Status,
    pub hotwater: Hotwater,
    pub zones: Vec<ZoneRecord>,
    /// `None` until the first complete refresh, and again after invalidation.
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl DeviceSnapshot {
    pub fn new(zone_count: u8) -> Self {
        DeviceSnapshot {
            zones: (1..=zone_count).map(ZoneRecord::new).collect(),
            ..Default::default()
        }
    }

    pub fn zone(&self, index: u8) -> Option<&ZoneRecord> {
        self.zones.iter().find(|z| z.index == index)
    }
}

// =====================
// Quick modes
// =====================

/// Which quick mode the arbiter should prefer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    None,
    Hotwater,
    Heating,
    HotwaterThenHeating,
}

impl FromStr for Strategy {
    type Err = UnknownWord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Strategy::None),
            "hotwater" => Ok(Strategy::Hotwater),
            "heating" => Ok(Strategy::Heating),
            "hotwater_then_heating" => Ok(Strategy::HotwaterThenHeating),
            _ => Err(UnknownWord(s.to_string())),
        }
    }
}

/// Result of evaluating a strategy against the current snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuickMode {
    None,
    Hotwater,
    Heating,
}

/// Override the arbiter currently considers active.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuickModeLabel {
    #[default]
    None,
    HotwaterBoost,
    HeatingVeto,
    /// Start was requested but nothing was eligible; held for a grace window.
    Idle,
}

impl QuickModeLabel {
    pub fn is_active(self) -> bool {
        self != QuickModeLabel::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuickModeLabel::None => "",
            QuickModeLabel::HotwaterBoost => "Hotwater Boost",
            QuickModeLabel::HeatingVeto => "Heating Quick Veto",
            QuickModeLabel::Idle => "Charger running idle",
        }
    }
}

impl fmt::Display for QuickModeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a strategy-based start request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(QuickModeLabel),
    /// A quick mode was already running; nothing was written.
    AlreadyActive(QuickModeLabel),
}

impl fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOutcome::Started(l) => write!(f, "{}", l),
            StartOutcome::AlreadyActive(l) => write!(f, "Error. A quickmode is already running ({})", l),
        }
    }
}

/// Zone veto parameters; `None` fields fall back to the library defaults.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VetoRequest {
    pub zone: Option<u8>,
    pub setpoint: Option<f64>,
    pub duration_hours: Option<f64>,
}

impl VetoRequest {
    pub fn for_zone(zone: u8) -> Self {
        VetoRequest {
            zone: Some(zone),
            ..Default::default()
        }
    }

    /// Negative inputs mean "use the default", as in the daemon front ends.
    pub fn from_raw(zone: i32, setpoint: f64, duration_hours: f64) -> Self {
        VetoRequest {
            zone: u8::try_from(zone).ok(),
            setpoint: (setpoint >= 0.0).then_some(setpoint),
            duration_hours: (duration_hours >= 0.0).then_some(duration_hours),
        }
    }

    pub fn zone_or(&self, default_zone: u8) -> u8 {
        self.zone.unwrap_or(default_zone)
    }

    pub fn setpoint_or_default(&self) -> f64 {
        self.setpoint.unwrap_or(DEFAULT_VETO_SETPOINT)
    }

    pub fn duration_or_default(&self) -> f64 {
        self.duration_hours.unwrap_or(DEFAULT_VETO_DURATION_HOURS)
    }
}
