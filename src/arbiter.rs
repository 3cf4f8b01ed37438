//! Quick-mode arbitration: which override is running, and which one a strategy would start.

use crate::models::ebus::{
    DeviceSnapshot, HotwaterSpecialFunction, OperationMode, QuickMode, QuickModeLabel, Strategy,
    ZoneSpecialFunction,
};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};
use serde::Serialize;

/// How long an idle label survives a snapshot that shows no override.
pub const IDLE_HOLD: TimeDelta = TimeDelta::minutes(10);

/// Hot-water boost threshold offset for strategies that do not put hot water first.
const NON_HOTWATER_OFFSET: f64 = -5.0;

/// Label implied by the controller's special-function flags.
///
/// If hot water and a zone are both flagged, the zone wins.
pub fn derive_label(snapshot: &DeviceSnapshot) -> QuickModeLabel {
    let mut label = QuickModeLabel::None;
    if snapshot.hotwater.special_function == Some(HotwaterSpecialFunction::Boost) {
        label = QuickModeLabel::HotwaterBoost;
    }
    if snapshot
        .zones
        .iter()
        .any(|z| z.special_function == Some(ZoneSpecialFunction::Veto))
    {
        label = QuickModeLabel::HeatingVeto;
    }
    label
}

pub fn hotwater_boost_eligible(snapshot: &DeviceSnapshot, strategy: Strategy) -> bool {
    let hw = &snapshot.hotwater;
    let offset = if strategy == Strategy::Hotwater { 0.0 } else { NON_HOTWATER_OFFSET };
    debug!(
        "Checking if hot water boost possible. Operation mode = {:?}, setpoint = {:.2}, storage = {:.2}",
        hw.operation_mode, hw.temp_desired, hw.storage_temp
    );
    hw.operation_mode == Some(OperationMode::Auto) && hw.storage_temp < hw.temp_desired + offset
}

pub fn heating_veto_eligible(snapshot: &DeviceSnapshot, zone: u8) -> bool {
    match snapshot.zone(zone) {
        Some(z) => {
            debug!("Checking if heating quick veto possible in zone {}. Operation mode = {:?}", zone, z.operation_mode);
            z.operation_mode == Some(OperationMode::Auto)
        }
        None => false,
    }
}

/// Quick mode `strategy` would start right now for `zone`.
pub fn which_quick_mode(snapshot: &DeviceSnapshot, strategy: Strategy, zone: u8) -> QuickMode {
    let hotwater = hotwater_boost_eligible(snapshot, strategy);
    let heating = heating_veto_eligible(snapshot, zone);

    let mode = match strategy {
        Strategy::None => QuickMode::None,
        Strategy::Hotwater if hotwater => QuickMode::Hotwater,
        Strategy::Heating if heating => QuickMode::Heating,
        Strategy::HotwaterThenHeating if hotwater => QuickMode::Hotwater,
        Strategy::HotwaterThenHeating if heating => QuickMode::Heating,
        _ => QuickMode::None,
    };
    if mode == QuickMode::None && strategy != Strategy::None {
        debug!("Strategy {:?} found no quick mode possible", strategy);
    }
    mode
}

/// Arbitration bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeState {
    pub active: QuickModeLabel,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ModeState {
    pub fn new(now: DateTime<Utc>) -> Self {
        ModeState {
            active: QuickModeLabel::None,
            started_at: now,
            stopped_at: None,
        }
    }

    pub fn activate(&mut self, label: QuickModeLabel, now: DateTime<Utc>) {
        info!("Quick mode \"{}\" -> \"{}\"", self.active, label);
        self.active = label;
        self.started_at = now;
    }

    pub fn clear(&mut self, now: DateTime<Utc>) {
        if self.active.is_active() {
            info!("Quick mode \"{}\" -> \"\"", self.active);
        }
        self.active = QuickModeLabel::None;
        self.stopped_at = Some(now);
    }

    fn idle_hold_active(&self, now: DateTime<Utc>) -> bool {
        self.active == QuickModeLabel::Idle && now < self.started_at + IDLE_HOLD
    }

    /// Follow the label the controller reports, except that a recent idle label is held.
    pub fn follow(&mut self, derived: QuickModeLabel, now: DateTime<Utc>) {
        if derived == self.active {
            return;
        }
        if derived.is_active() {
            self.activate(derived, now);
        } else if self.idle_hold_active(now) {
            debug!("Idle mode active for less than {} minutes; keeping it", IDLE_HOLD.num_minutes());
        } else {
            self.clear(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn snapshot() -> DeviceSnapshot {
        let mut snap = DeviceSnapshot::new(3);
        snap.hotwater.operation_mode = Some(OperationMode::Auto);
        snap.hotwater.special_function = Some(HotwaterSpecialFunction::Normal);
        snap.hotwater.temp_desired = 50.0;
        snap.hotwater.storage_temp = 40.0;
        for z in snap.zones.iter_mut() {
            z.operation_mode = Some(OperationMode::Auto);
            z.special_function = Some(ZoneSpecialFunction::Auto);
        }
        snap
    }

    #[test]
    fn derive_label_follows_flags() {
        let mut snap = snapshot();
        assert_eq!(derive_label(&snap), QuickModeLabel::None);

        snap.hotwater.special_function = Some(HotwaterSpecialFunction::Boost);
        assert_eq!(derive_label(&snap), QuickModeLabel::HotwaterBoost);
        assert_eq!(derive_label(&snap), derive_label(&snap));

        snap.hotwater.special_function = Some(HotwaterSpecialFunction::Normal);
        snap.zones[2].special_function = Some(ZoneSpecialFunction::Veto);
        assert_eq!(derive_label(&snap), QuickModeLabel::HeatingVeto);
    }

    #[test]
    fn zone_flag_wins_over_hotwater_flag() {
        let mut snap = snapshot();
        snap.hotwater.special_function = Some(HotwaterSpecialFunction::Boost);
        snap.zones[0].special_function = Some(ZoneSpecialFunction::Veto);
        assert_eq!(derive_label(&snap), QuickModeLabel::HeatingVeto);
    }

    #[test]
    fn hotwater_strategy_boosts_below_setpoint() {
        let snap = snapshot();
        assert_eq!(which_quick_mode(&snap, Strategy::Hotwater, 1), QuickMode::Hotwater);
    }

    #[test]
    fn non_hotwater_strategies_need_five_degree_deficit() {
        let mut snap = snapshot();
        snap.hotwater.storage_temp = 46.0;
        assert_eq!(which_quick_mode(&snap, Strategy::Hotwater, 1), QuickMode::Hotwater);
        assert_eq!(which_quick_mode(&snap, Strategy::HotwaterThenHeating, 1), QuickMode::Heating);

        snap.hotwater.storage_temp = 44.9;
        assert_eq!(which_quick_mode(&snap, Strategy::HotwaterThenHeating, 1), QuickMode::Hotwater);
    }

    #[test]
    fn falls_back_to_heating_when_hotwater_off() {
        let mut snap = snapshot();
        snap.hotwater.operation_mode = Some(OperationMode::Off);
        assert_eq!(which_quick_mode(&snap, Strategy::HotwaterThenHeating, 2), QuickMode::Heating);
        assert_eq!(which_quick_mode(&snap, Strategy::Hotwater, 2), QuickMode::None);
    }

    #[test]
    fn heating_needs_target_zone_in_auto() {
        let mut snap = snapshot();
        snap.zones[0].operation_mode = Some(OperationMode::Day);
        assert_eq!(which_quick_mode(&snap, Strategy::Heating, 1), QuickMode::None);
        assert_eq!(which_quick_mode(&snap, Strategy::Heating, 2), QuickMode::Heating);
        // zone 0 is the unset default and matches nothing
        assert_eq!(which_quick_mode(&snap, Strategy::Heating, 0), QuickMode::None);
        assert_eq!(which_quick_mode(&snap, Strategy::None, 2), QuickMode::None);
    }

    #[test]
    fn follow_tracks_derived_label() {
        let mut state = ModeState::new(t0());
        state.follow(QuickModeLabel::HotwaterBoost, t0());
        assert_eq!(state.active, QuickModeLabel::HotwaterBoost);
        assert_eq!(state.started_at, t0());

        let later = t0() + TimeDelta::minutes(1);
        state.follow(QuickModeLabel::None, later);
        assert_eq!(state.active, QuickModeLabel::None);
        assert_eq!(state.stopped_at, Some(later));
    }

    #[test]
    fn idle_label_is_held_for_ten_minutes() {
        let mut state = ModeState::new(t0());
        state.activate(QuickModeLabel::Idle, t0());

        state.follow(QuickModeLabel::None, t0() + TimeDelta::minutes(9));
        assert_eq!(state.active, QuickModeLabel::Idle);
        assert_eq!(state.stopped_at, None);

        state.follow(QuickModeLabel::None, t0() + IDLE_HOLD);
        assert_eq!(state.active, QuickModeLabel::None);
        assert_eq!(state.stopped_at, Some(t0() + IDLE_HOLD));
    }

    #[test]
    fn idle_label_gives_way_to_reported_override() {
        let mut state = ModeState::new(t0());
        state.activate(QuickModeLabel::Idle, t0());
        let later = t0() + TimeDelta::minutes(2);
        state.follow(QuickModeLabel::HeatingVeto, later);
        assert_eq!(state.active, QuickModeLabel::HeatingVeto);
        assert_eq!(state.started_at, later);
    }
}
