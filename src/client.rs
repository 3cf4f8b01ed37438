//! Connection handle for one heating controller behind ebusd.
//!
//! - Owns the gateway session, the snapshot cache and the quick-mode bookkeeping.
//! - Blocking; run independent handles on independent threads, or wrap one in a `Mutex`.
//! - Every state-changing write invalidates the cache so the next read sees its effect.

use crate::arbiter::{self, ModeState};
use crate::cache::{DEFAULT_UPDATE_INTERVAL, StateCache};
use crate::models::ebus::{
    self as m, DEFAULT_ZONE_COUNT, DEFAULT_ZONE_INDEX, DeviceSnapshot, HotwaterSpecialFunction, QuickMode,
    QuickModeLabel, StartOutcome, Strategy, VetoRequest, ZoneSpecialFunction, zone_value,
};
use crate::session::{EbusError, GatewaySession, RetryPolicy};
use chrono::Utc;
use log::{debug, info, warn};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub update_interval: Duration,
    pub zone_count: u8,
    /// Zone used when a request does not name one.
    pub default_zone: u8,
    pub retry: RetryPolicy,
    /// Socket read/write timeout; `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            zone_count: DEFAULT_ZONE_COUNT,
            default_zone: DEFAULT_ZONE_INDEX,
            retry: RetryPolicy::default(),
            io_timeout: None,
        }
    }
}

pub struct EbusClient {
    session: GatewaySession,
    cache: StateCache,
    mode: ModeState,
    controller: String,
    default_zone: u8,
}

impl EbusClient {
    /// Connect, list the bus participants and resolve the controller that owns quick modes.
    pub fn connect(address: impl Into<String>, options: ClientOptions) -> Result<Self, EbusError> {
        let mut session = GatewaySession::new(address, options.retry, options.io_timeout);
        session.open()?;
        let handshake = Self::handshake(&mut session);
        session.close();
        let controller = handshake?;
        info!("Connected to ebusd at {} (controller for quick modes: {})", session.address(), controller);

        Ok(EbusClient {
            session,
            cache: StateCache::new(options.zone_count, options.update_interval),
            mode: ModeState::new(Utc::now()),
            controller,
            default_zone: options.default_zone,
        })
    }

    fn handshake(session: &mut GatewaySession) -> Result<String, EbusError> {
        let listing = session.scan()?;
        debug!("Scan result:\n{}", listing.trim_end());
        session.find_controller_for(m::HOTWATER_SF_MODE)
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn current_override_label(&self) -> QuickModeLabel {
        self.mode.active
    }

    pub fn mode_state(&self) -> &ModeState {
        &self.mode
    }

    /// Refresh the cache if stale (or forced) and re-derive the active quick mode.
    fn refresh(&mut self, force: bool) -> Result<(), EbusError> {
        let now = Utc::now();
        self.cache.refresh(&mut self.session, force, now)?;
        self.mode.follow(arbiter::derive_label(self.cache.snapshot()), now);
        Ok(())
    }

    pub fn get_snapshot(&mut self, force_refresh: bool) -> Result<DeviceSnapshot, EbusError> {
        self.refresh(force_refresh)?;
        Ok(self.cache.snapshot().clone())
    }

    /// Read every named value once to verify the daemon's configuration; see [`StateCache::diagnose`].
    pub fn check_configuration(&mut self) -> Result<String, EbusError> {
        StateCache::diagnose(&mut self.session, self.cache.zone_count())
    }

    /// Current electrical consumption in watts.
    pub fn current_power_watts(&mut self) -> Result<f64, EbusError> {
        self.refresh(false)?;
        Ok(self.cache.snapshot().status.current_consumed_power * 1000.0)
    }

    /// When the running heating veto ends, as the controller reports it.
    pub fn quick_mode_expires_at(&self, zone: Option<u8>) -> Option<String> {
        if self.mode.active != QuickModeLabel::HeatingVeto {
            return None;
        }
        let z = self.cache.snapshot().zone(zone.unwrap_or(self.default_zone))?;
        let (date, time) = (z.quick_veto_end_date.trim(), z.quick_veto_end_time.trim());
        if date.is_empty() || date == "-" || time.is_empty() || time == "-" {
            return None;
        }
        Some(format!("{} {}", date, time))
    }

    fn write_for_controller(&mut self, name: &str, value: &str) -> Result<String, EbusError> {
        let message = format!("-c {} {} {}", self.controller, name, value);
        self.session.write(&message)
    }

    pub fn start_hotwater_boost(&mut self) -> Result<(), EbusError> {
        let result = self.write_for_controller(m::HOTWATER_SF_MODE, HotwaterSpecialFunction::Boost.as_str());
        self.cache.invalidate();
        if let Err(e) = &result {
            warn!("Could not start hot water boost: {}", e);
        }
        result.map(|_| ())
    }

    pub fn stop_hotwater_boost(&mut self) -> Result<(), EbusError> {
        let result = self.write_for_controller(m::HOTWATER_SF_MODE, HotwaterSpecialFunction::Normal.as_str());
        self.cache.invalidate();
        if let Err(e) = &result {
            warn!("Could not stop hot water boost: {}", e);
        }
        result.map(|_| ())
    }

    /// Write the veto setpoint, then the duration that starts the veto.
    pub fn start_zone_veto(&mut self, request: &VetoRequest) -> Result<(), EbusError> {
        let zone = request.zone_or(self.default_zone);
        let setpoint = format!("{:.1}", request.setpoint_or_default());
        let duration = format!("{:.1}", request.duration_or_default());

        let result = self
            .write_for_controller(&zone_value(zone, m::ZONE_QUICK_VETO_TEMP), &setpoint)
            .and_then(|_| self.write_for_controller(&zone_value(zone, m::ZONE_QUICK_VETO_DURATION), &duration));
        self.cache.invalidate();
        match result {
            Ok(_) => {
                debug!("Zone {} quick veto: {} °C for {} h", zone, setpoint, duration);
                Ok(())
            }
            Err(e) => {
                warn!("Could not start zone {} quick veto: {}", zone, e);
                Err(e)
            }
        }
    }

    pub fn stop_zone_veto(&mut self, zone: Option<u8>) -> Result<(), EbusError> {
        let zone = zone.unwrap_or(self.default_zone);
        let result = self.write_for_controller(&zone_value(zone, m::ZONE_SF_MODE), ZoneSpecialFunction::Auto.as_str());
        self.cache.invalidate();
        if let Err(e) = &result {
            warn!("Could not stop zone {} quick veto: {}", zone, e);
        }
        result.map(|_| ())
    }

    /// Start whatever quick mode `strategy` picks, unless one is already running.
    ///
    /// With nothing eligible, the arbiter enters the idle label without writing anything.
    pub fn start_by_strategy(&mut self, strategy: Strategy, request: &VetoRequest) -> Result<StartOutcome, EbusError> {
        let result = self.start_by_strategy_inner(strategy, request);
        self.cache.invalidate();
        result
    }

    fn start_by_strategy_inner(&mut self, strategy: Strategy, request: &VetoRequest) -> Result<StartOutcome, EbusError> {
        self.refresh(true)?;

        if self.mode.active.is_active() {
            let snap = self.cache.snapshot();
            info!(
                "System is already in quick mode \"{}\" (hot water: {:?}, zones: {:?})",
                self.mode.active,
                snap.hotwater.special_function,
                snap.zones.iter().map(|z| z.special_function).collect::<Vec<_>>()
            );
            return Ok(StartOutcome::AlreadyActive(self.mode.active));
        }

        let zone = request.zone_or(self.default_zone);
        let pick = arbiter::which_quick_mode(self.cache.snapshot(), strategy, zone);
        debug!("Strategy {:?} for zone {} picked {:?}", strategy, zone, pick);

        match pick {
            QuickMode::Hotwater => {
                self.start_hotwater_boost()?;
                self.mode.activate(QuickModeLabel::HotwaterBoost, Utc::now());
            }
            QuickMode::Heating => {
                self.start_zone_veto(request)?;
                self.mode.activate(QuickModeLabel::HeatingVeto, Utc::now());
            }
            QuickMode::None => {
                info!("Start requested but no quick mode possible; entering idle mode");
                self.mode.activate(QuickModeLabel::Idle, Utc::now());
            }
        }
        Ok(StartOutcome::Started(self.mode.active))
    }

    /// Stop the running quick mode and return its label (`None` if nothing was running).
    ///
    /// Afterwards [`EbusClient::current_override_label`] is `None`, even when the stop write fails.
    pub fn stop_by_strategy(&mut self, zone: Option<u8>) -> Result<QuickModeLabel, EbusError> {
        let refreshed = self.refresh(true);
        let stopping = self.mode.active;
        let result = match refreshed {
            Err(e) => {
                warn!("Could not read current state before stopping quick mode: {}", e);
                Err(e)
            }
            Ok(()) => match stopping {
                QuickModeLabel::HotwaterBoost => self.stop_hotwater_boost(),
                QuickModeLabel::HeatingVeto => self.stop_zone_veto(zone),
                QuickModeLabel::Idle => {
                    debug!("Stopping idle quick mode");
                    Ok(())
                }
                QuickModeLabel::None => {
                    debug!("Nothing to do, no quick mode active");
                    Ok(())
                }
            },
        };

        self.mode.clear(Utc::now());
        self.cache.invalidate();
        result.map(|()| stopping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ebus::OperationMode;
    use crate::simulator::FakeDaemon;

    fn options() -> ClientOptions {
        ClientOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
            io_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    fn client_for(daemon: &FakeDaemon) -> EbusClient {
        EbusClient::connect(daemon.address(), options()).expect("connect")
    }

    #[test]
    fn connect_resolves_controller() {
        let daemon = FakeDaemon::start();
        let client = client_for(&daemon);
        assert_eq!(client.controller(), daemon.controller());
        assert_eq!(client.current_override_label(), QuickModeLabel::None);
    }

    #[test]
    fn connect_fails_on_empty_scan() {
        let daemon = FakeDaemon::start();
        daemon.empty_scan(true);
        assert!(matches!(
            EbusClient::connect(daemon.address(), options()),
            Err(EbusError::Protocol(_))
        ));
    }

    #[test]
    fn stop_reports_mode_seen_on_daemon() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcSFMode", "load");
        // fresh handle: nothing derived yet, the stop refresh finds the boost
        let mut client = client_for(&daemon);
        assert_eq!(client.current_override_label(), QuickModeLabel::None);

        assert_eq!(client.stop_by_strategy(None).expect("stop"), QuickModeLabel::HotwaterBoost);
        assert_eq!(daemon.writes(), vec!["-c 15 HwcSFMode auto".to_string()]);
        assert_eq!(client.stop_by_strategy(None).expect("stop again"), QuickModeLabel::None);
    }

    #[test]
    fn connect_fails_when_controller_unknown() {
        let daemon = FakeDaemon::start();
        daemon.remove_value("HwcSFMode");
        assert!(matches!(
            EbusClient::connect(daemon.address(), options()),
            Err(EbusError::Protocol(_))
        ));
    }

    #[test]
    fn snapshot_is_cached_between_calls() {
        let daemon = FakeDaemon::start();
        let mut client = client_for(&daemon);
        let first = client.get_snapshot(false).expect("snapshot");
        let reads = daemon.total_reads();
        let second = client.get_snapshot(false).expect("snapshot");
        assert_eq!(first, second);
        assert_eq!(daemon.total_reads(), reads);
    }

    #[test]
    fn power_is_reported_in_watts() {
        let daemon = FakeDaemon::start();
        daemon.set_value("CurrentConsumedPower", "2.5");
        let mut client = client_for(&daemon);
        assert_eq!(client.current_power_watts().expect("power"), 2500.0);
    }

    #[test]
    fn hotwater_boost_writes_and_invalidates() {
        let daemon = FakeDaemon::start();
        let mut client = client_for(&daemon);
        client.get_snapshot(false).expect("snapshot");

        client.start_hotwater_boost().expect("boost");
        assert_eq!(daemon.writes(), vec!["-c 15 HwcSFMode load".to_string()]);
        let snap = client.get_snapshot(false).expect("snapshot after write");
        assert_eq!(snap.hotwater.special_function, Some(HotwaterSpecialFunction::Boost));
        assert_eq!(client.current_override_label(), QuickModeLabel::HotwaterBoost);

        client.stop_hotwater_boost().expect("stop");
        assert_eq!(daemon.value("HwcSFMode").as_deref(), Some("auto"));
    }

    #[test]
    fn zone_veto_writes_setpoint_then_duration() {
        let daemon = FakeDaemon::start();
        let mut client = client_for(&daemon);
        client
            .start_zone_veto(&VetoRequest::from_raw(2, 18.0, -1.0))
            .expect("veto");
        assert_eq!(
            daemon.writes(),
            vec![
                "-c 15 z2QuickVetoTemp 18.0".to_string(),
                "-c 15 z2QuickVetoDuration 0.5".to_string()
            ]
        );
        client.stop_zone_veto(Some(2)).expect("stop veto");
        assert_eq!(daemon.writes().last().map(String::as_str), Some("-c 15 z2SFMode auto"));
    }

    #[test]
    fn failed_veto_setpoint_skips_duration() {
        let daemon = FakeDaemon::start();
        let mut client = client_for(&daemon);
        daemon.refuse_writes(true);
        assert!(matches!(
            client.start_zone_veto(&VetoRequest::for_zone(1)),
            Err(EbusError::Transport { .. })
        ));
        assert_eq!(daemon.writes(), Vec::<String>::new());
    }

    #[test]
    fn strategy_start_boosts_hot_water() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcStorageTemp", "40.0");
        let mut client = client_for(&daemon);

        let outcome = client
            .start_by_strategy(Strategy::Hotwater, &VetoRequest::for_zone(1))
            .expect("start");
        assert_eq!(outcome, StartOutcome::Started(QuickModeLabel::HotwaterBoost));
        assert_eq!(daemon.writes(), vec!["-c 15 HwcSFMode load".to_string()]);
    }

    #[test]
    fn strategy_start_falls_back_to_zone_veto() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcOpMode", "off");
        let mut client = client_for(&daemon);

        let outcome = client
            .start_by_strategy(Strategy::HotwaterThenHeating, &VetoRequest::for_zone(1))
            .expect("start");
        assert_eq!(outcome, StartOutcome::Started(QuickModeLabel::HeatingVeto));
        let snap = client.get_snapshot(false).expect("snapshot");
        assert_eq!(snap.zones[0].special_function, Some(ZoneSpecialFunction::Veto));
        assert_eq!(client.current_override_label(), QuickModeLabel::HeatingVeto);
    }

    #[test]
    fn strategy_start_goes_idle_without_writing() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcOpMode", "off");
        daemon.set_value("z1OpMode", "day");
        let mut client = client_for(&daemon);

        let outcome = client
            .start_by_strategy(Strategy::HotwaterThenHeating, &VetoRequest::for_zone(1))
            .expect("start");
        assert_eq!(outcome, StartOutcome::Started(QuickModeLabel::Idle));
        assert!(daemon.writes().is_empty());

        // the controller shows no override, but the idle label is held
        client.get_snapshot(true).expect("snapshot");
        assert_eq!(client.current_override_label(), QuickModeLabel::Idle);
    }

    #[test]
    fn strategy_start_is_noop_when_already_active() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcSFMode", "load");
        let mut client = client_for(&daemon);

        let outcome = client
            .start_by_strategy(Strategy::HotwaterThenHeating, &VetoRequest::for_zone(1))
            .expect("start");
        assert_eq!(outcome, StartOutcome::AlreadyActive(QuickModeLabel::HotwaterBoost));
        assert!(daemon.writes().is_empty());
        assert_eq!(client.current_override_label(), QuickModeLabel::HotwaterBoost);
    }

    #[test]
    fn strategy_stop_undoes_start() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcOpMode", "off");
        let mut client = client_for(&daemon);
        client
            .start_by_strategy(Strategy::HotwaterThenHeating, &VetoRequest::for_zone(3))
            .expect("start");

        let label = client.stop_by_strategy(Some(3)).expect("stop");
        assert_eq!(label, QuickModeLabel::HeatingVeto);
        assert_eq!(client.current_override_label(), QuickModeLabel::None);
        assert_eq!(daemon.writes().last().map(String::as_str), Some("-c 15 z3SFMode auto"));
        assert!(client.mode_state().stopped_at.is_some());
        let snap = client.get_snapshot(false).expect("snapshot");
        assert_eq!(snap.zones[2].special_function, Some(ZoneSpecialFunction::Auto));
    }

    #[test]
    fn strategy_stop_clears_label_even_if_write_fails() {
        let daemon = FakeDaemon::start();
        let mut client = client_for(&daemon);
        client
            .start_by_strategy(Strategy::Hotwater, &VetoRequest::for_zone(1))
            .expect("start");
        assert_eq!(client.current_override_label(), QuickModeLabel::HotwaterBoost);

        daemon.refuse_writes(true);
        assert!(client.stop_by_strategy(None).is_err());
        assert_eq!(client.current_override_label(), QuickModeLabel::None);
    }

    #[test]
    fn strategy_stop_clears_idle_label() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcOpMode", "off");
        daemon.set_value("z1OpMode", "off");
        let mut client = client_for(&daemon);
        client
            .start_by_strategy(Strategy::Heating, &VetoRequest::for_zone(1))
            .expect("start");
        assert_eq!(client.current_override_label(), QuickModeLabel::Idle);

        assert_eq!(client.stop_by_strategy(Some(1)).expect("stop"), QuickModeLabel::Idle);
        assert_eq!(client.current_override_label(), QuickModeLabel::None);
        assert!(daemon.writes().is_empty());
    }

    #[test]
    fn veto_expiry_comes_from_zone() {
        let daemon = FakeDaemon::start();
        daemon.set_value("z1QuickVetoEndDate", "19.10.2026");
        daemon.set_value("z1QuickVetoEndTime", "14:30");
        daemon.set_value("z1SFMode", "veto");
        let mut client = client_for(&daemon);
        assert_eq!(client.quick_mode_expires_at(Some(1)), None);

        let snap = client.get_snapshot(false).expect("snapshot");
        assert_eq!(snap.zones[0].operation_mode, Some(OperationMode::Auto));
        assert_eq!(client.current_override_label(), QuickModeLabel::HeatingVeto);
        assert_eq!(client.quick_mode_expires_at(Some(1)).as_deref(), Some("19.10.2026 14:30"));
        assert_eq!(client.quick_mode_expires_at(Some(2)), None);
    }

    #[test]
    fn check_configuration_flags_missing_values() {
        let daemon = FakeDaemon::start();
        let mut client = client_for(&daemon);
        assert!(client.check_configuration().is_ok());

        daemon.remove_value("z1Name1");
        assert!(matches!(
            client.check_configuration(),
            Err(EbusError::ElementNotFound { names, .. }) if names == vec!["z1Name1".to_string()]
        ));
    }
}
