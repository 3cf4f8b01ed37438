//! Time-windowed snapshot of device values.
//!
//! A refresh reads every named value over one batch connection, validates each answer and
//! only then replaces the cached snapshot. A value that fails validation keeps its previous
//! content; only a transport failure aborts the batch.

use crate::models::ebus::{self as m, DeviceSnapshot, UnknownWord, zone_value};
use crate::session::{ERR_ELEMENT_NOT_FOUND, ERR_PREFIX, EbusError, GatewaySession};
use chrono::{DateTime, TimeDelta, Utc};
use core::fmt;
use log::{debug, info, warn};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(120);

/// Inclusive range a numeric value must fall in.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

pub const HOTWATER_TEMP: Bounds = Bounds { min: 0.0, max: 75.0 };
pub const ZONE_TEMP: Bounds = Bounds { min: 0.0, max: 50.0 };
pub const WATER_PRESSURE: Bounds = Bounds { min: 0.0, max: 5.0 };
pub const CONSUMED_POWER: Bounds = Bounds { min: 0.0, max: 30.0 };
pub const OUTSIDE_TEMP: Bounds = Bounds { min: -60.0, max: 60.0 };
pub const FLOW_TEMP: Bounds = Bounds { min: 0.0, max: 100.0 };

/// Why a daemon answer was not stored. Logged, never propagated.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldError {
    Unparsable(String),
    OutOfRange { value: f64, bounds: Bounds },
    UnknownWord(String),
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldError::Unparsable(raw) => write!(f, "'{}' is not a number", raw),
            FieldError::OutOfRange { value, bounds } => {
                write!(f, "{} is not in range [{:.2},{:.2}]", value, bounds.min, bounds.max)
            }
            FieldError::UnknownWord(raw) => write!(f, "'{}' is not a known mode", raw),
        }
    }
}

impl std::error::Error for FieldError {}

impl From<UnknownWord> for FieldError {
    fn from(value: UnknownWord) -> Self {
        FieldError::UnknownWord(value.0)
    }
}

/// Parse a numeric answer. A lone `-` is the daemon's "no value" and reads as `0.0`.
pub fn parse_bounded(raw: &str, bounds: Bounds) -> Result<f64, FieldError> {
    if raw == "-" {
        return Ok(0.0);
    }
    let value = raw
        .parse::<f64>()
        .map_err(|_| FieldError::Unparsable(raw.to_string()))?;
    if value < bounds.min || value > bounds.max {
        return Err(FieldError::OutOfRange { value, bounds });
    }
    Ok(value)
}

/// Reads one value at a time into a staged snapshot, logging and skipping bad answers.
struct FieldReader<'a> {
    session: &'a mut GatewaySession,
    rejected: usize,
}

impl FieldReader<'_> {
    fn bounded(&mut self, name: &str, max_age: Option<u32>, bounds: Bounds, target: &mut f64) -> Result<(), EbusError> {
        let raw = self.session.read(name, max_age)?;
        match parse_bounded(&raw, bounds) {
            Ok(v) => *target = v,
            Err(e) => self.reject(name, &raw, e),
        }
        Ok(())
    }

    fn word<T>(&mut self, name: &str, max_age: Option<u32>, target: &mut Option<T>) -> Result<(), EbusError>
    where
        T: FromStr<Err = UnknownWord>,
    {
        let raw = self.session.read(name, max_age)?;
        match raw.parse::<T>() {
            Ok(v) => *target = Some(v),
            Err(e) => self.reject(name, &raw, e.into()),
        }
        Ok(())
    }

    fn text(&mut self, name: &str, target: &mut String) -> Result<(), EbusError> {
        let raw = self.session.read(name, None)?;
        if raw.starts_with(ERR_PREFIX) {
            warn!("ebusd answered '{}' for {}; keeping previous value", raw, name);
            self.rejected += 1;
        } else {
            *target = raw;
        }
        Ok(())
    }

    fn reject(&mut self, name: &str, raw: &str, err: FieldError) {
        warn!("Value '{}' returned from ebusd for {} invalid and therefore ignored: {}", raw, name, err);
        self.rejected += 1;
    }
}

fn read_snapshot(reader: &mut FieldReader<'_>, snap: &mut DeviceSnapshot) -> Result<(), EbusError> {
    let hw = &mut snap.hotwater;
    reader.word(m::HOTWATER_OP_MODE, None, &mut hw.operation_mode)?;
    reader.bounded(m::HOTWATER_TEMP_DESIRED, None, HOTWATER_TEMP, &mut hw.temp_desired)?;
    reader.bounded(m::HOTWATER_STORAGE_TEMP, Some(60), HOTWATER_TEMP, &mut hw.storage_temp)?;
    reader.word(m::HOTWATER_SF_MODE, Some(0), &mut hw.special_function)?;

    let st = &mut snap.status;
    reader.text(m::STATUS_TIME, &mut st.time)?;
    reader.bounded(m::STATUS_OUTSIDE_TEMP, None, OUTSIDE_TEMP, &mut st.outside_temperature)?;
    reader.bounded(m::STATUS_SYSTEM_FLOW_TEMP, None, FLOW_TEMP, &mut st.system_flow_temperature)?;
    reader.bounded(m::STATUS_WATER_PRESSURE, None, WATER_PRESSURE, &mut st.water_pressure)?;
    reader.bounded(m::STATUS_CURRENT_CONSUMED_POWER, Some(60), CONSUMED_POWER, &mut st.current_consumed_power)?;
    reader.text(m::STATUS_STATUS01, &mut st.status01)?;
    reader.text(m::STATUS_STATE, &mut st.state)?;

    for zone in snap.zones.iter_mut() {
        let index = zone.index;
        let z = |name: &str| zone_value(index, name);
        reader.word(&z(m::ZONE_OP_MODE), None, &mut zone.operation_mode)?;
        reader.word(&z(m::ZONE_SF_MODE), Some(0), &mut zone.special_function)?;
        reader.bounded(&z(m::ZONE_ROOM_TEMP_DESIRED), None, ZONE_TEMP, &mut zone.room_temp_desired)?;
        reader.bounded(&z(m::ZONE_ROOM_TEMP), Some(180), ZONE_TEMP, &mut zone.room_temp)?;
        reader.bounded(&z(m::ZONE_QUICK_VETO_TEMP), Some(0), ZONE_TEMP, &mut zone.quick_veto_temp)?;
        reader.text(&z(m::ZONE_QUICK_VETO_END_DATE), &mut zone.quick_veto_end_date)?;
        reader.text(&z(m::ZONE_QUICK_VETO_END_TIME), &mut zone.quick_veto_end_time)?;
        reader.text(&z(m::ZONE_SHORT_NAME), &mut zone.short_name)?;
        reader.text(&z(m::ZONE_NAME1), &mut zone.name1)?;
        reader.text(&z(m::ZONE_NAME2), &mut zone.name2)?;
    }
    Ok(())
}

/// Every named value this client depends on, in diagnostic order.
pub fn diagnostic_names(zone_count: u8) -> Vec<String> {
    let mut names = Vec::with_capacity(m::HOTWATER_VALUES.len() + m::STATUS_VALUES.len() + m::ZONE_VALUES.len() * zone_count as usize);
    names.extend(m::HOTWATER_VALUES.iter().map(|n| n.to_string()));
    names.extend(m::STATUS_VALUES.iter().map(|n| n.to_string()));
    for index in 1..=zone_count {
        names.extend(m::ZONE_VALUES.iter().map(|n| zone_value(index, n)));
    }
    names
}

pub struct StateCache {
    snapshot: DeviceSnapshot,
    update_interval: TimeDelta,
}

impl StateCache {
    pub fn new(zone_count: u8, update_interval: Duration) -> Self {
        StateCache {
            snapshot: DeviceSnapshot::new(zone_count),
            update_interval: TimeDelta::from_std(update_interval).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn snapshot(&self) -> &DeviceSnapshot {
        &self.snapshot
    }

    pub fn zone_count(&self) -> u8 {
        self.snapshot.zones.len() as u8
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.snapshot.last_refreshed {
            Some(at) => at
                .checked_add_signed(self.update_interval)
                .is_none_or(|expires| now < expires),
            None => false,
        }
    }

    /// Force the next [`StateCache::refresh`] to hit the daemon.
    pub fn invalidate(&mut self) {
        self.snapshot.last_refreshed = None;
    }

    /// Re-read all values unless the snapshot is still fresh. Returns whether the daemon was asked.
    pub fn refresh(&mut self, session: &mut GatewaySession, force: bool, now: DateTime<Utc>) -> Result<bool, EbusError> {
        if !force && self.is_fresh(now) {
            debug!("Snapshot from {:?} still fresh; skipping ebusd reads", self.snapshot.last_refreshed);
            return Ok(false);
        }

        let mut staged = self.snapshot.clone();
        session.open()?;
        let mut reader = FieldReader {
            session: &mut *session,
            rejected: 0,
        };
        let result = read_snapshot(&mut reader, &mut staged);
        let rejected = reader.rejected;
        session.close();

        if let Err(e) = result {
            warn!("Refresh aborted, keeping snapshot from {:?}: {}", self.snapshot.last_refreshed, e);
            return Err(e);
        }

        staged.last_refreshed = Some(now);
        self.snapshot = staged;
        if rejected > 0 {
            info!("Snapshot refreshed; {} value(s) kept from before", rejected);
        } else {
            debug!("Snapshot refreshed");
        }
        Ok(true)
    }

    /// Try every named value and report what the daemon answered.
    ///
    /// Fails with [`EbusError::ElementNotFound`] (carrying the report) if any value is unknown
    /// to the daemon, which means its configuration does not match this client.
    pub fn diagnose(session: &mut GatewaySession, zone_count: u8) -> Result<String, EbusError> {
        debug!("Checking ebusd configuration");
        session.open()?;

        let mut report = String::new();
        let mut missing = Vec::new();
        for name in diagnostic_names(zone_count) {
            match session.read(&name, None) {
                Ok(answer) if answer.starts_with(ERR_PREFIX) => {
                    debug!("Value '{}' returned from ebusd for {}", answer, name);
                    report.push_str(&format!("Trying to read {}. Error: {}\n", name, answer));
                    if answer == ERR_ELEMENT_NOT_FOUND {
                        missing.push(name);
                    }
                }
                Ok(answer) => {
                    report.push_str(&format!("Trying to read {}. Result: {}\n", name, answer));
                }
                Err(e) => {
                    debug!("Reading {} failed: {}", name, e);
                    report.push_str(&format!("Trying to read {}. Error: {}\n", name, e));
                }
            }
        }
        session.close();

        if missing.is_empty() {
            Ok(report)
        } else {
            Err(EbusError::ElementNotFound { names: missing, report })
        }
    }
}
