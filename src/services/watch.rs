use crate::arbiter::ModeState;
use crate::client::EbusClient;
use crate::models::ebus::DeviceSnapshot;
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemDump<'a> {
    snapshot: &'a DeviceSnapshot,
    mode: &'a ModeState,
}

/// Poll the controller every `interval`, logging a one-line summary per tick.
///
/// Runs forever unless `ticks` limits it. A failed refresh is logged and the loop carries on.
pub fn run_loop(client: &mut EbusClient, interval: Duration, system_file: Option<&Path>, ticks: Option<u64>) -> Result<(), String> {
    let mut done = 0u64;
    loop {
        let tick_start = Instant::now();

        match client.get_snapshot(false) {
            Ok(snapshot) => {
                info!("{}", summary(&snapshot, client.mode_state()));
                if let Some(path) = system_file {
                    write_system_file(path, &snapshot, client.mode_state())?;
                }
            }
            Err(e) => warn!("Refresh failed, will retry next tick: {}", e),
        }

        done += 1;
        if ticks.is_some_and(|limit| done >= limit) {
            return Ok(());
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

pub fn summary(snapshot: &DeviceSnapshot, mode: &ModeState) -> String {
    let hw = &snapshot.hotwater;
    let mut line = format!(
        "outside {:.1} °C, flow {:.1} °C, {:.0} W | hot water {:.1}/{:.1} °C {}",
        snapshot.status.outside_temperature,
        snapshot.status.system_flow_temperature,
        snapshot.status.current_consumed_power * 1000.0,
        hw.storage_temp,
        hw.temp_desired,
        hw.special_function.map(|f| f.as_str()).unwrap_or("-"),
    );
    for z in &snapshot.zones {
        line.push_str(&format!(
            " | {} {:.1}/{:.1} °C {}",
            z.display_name(),
            z.room_temp,
            z.room_temp_desired,
            z.special_function.map(|f| f.as_str()).unwrap_or("-"),
        ));
    }
    if mode.active.is_active() {
        line.push_str(&format!(" | quick mode \"{}\" since {}", mode.active, mode.started_at.format("%H:%M:%S")));
    }
    line
}

/// Write the snapshot and the quick-mode bookkeeping as pretty JSON.
pub fn write_system_file(path: &Path, snapshot: &DeviceSnapshot, mode: &ModeState) -> Result<(), String> {
    let json = serde_json::to_string_pretty(&SystemDump { snapshot, mode })
        .map_err(|e| format!("serialize system info failed: {}", e))?;
    fs::write(path, json).map_err(|e| format!("write {} failed: {}", path.display(), e))
}
