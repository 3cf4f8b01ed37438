//! In-process stand-in for ebusd.
//!
//! Speaks the same line dialect as the real daemon (`scan result`, `find`, `read`, `write`),
//! backed by a table of named values. Used by the tests and by `--simulate` demo runs.

use crate::models::ebus::{self as m, zone_value};
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

const CONTROLLER: &str = "15";

#[derive(Default)]
struct DaemonState {
    values: BTreeMap<String, String>,
    /// Answers handed out (once each) before falling back to `values`.
    scripted: BTreeMap<String, VecDeque<String>>,
    reads: BTreeMap<String, usize>,
    writes: Vec<String>,
    refuse_writes: bool,
    hang_up_after_answer: bool,
    empty_scan: bool,
    /// Open client connections by id; each serving thread removes its own entry.
    live: BTreeMap<u64, TcpStream>,
    accepted: u64,
    noise: Option<SmallRng>,
}

pub struct FakeDaemon {
    addr: SocketAddr,
    state: Arc<Mutex<DaemonState>>,
    stop: Arc<AtomicBool>,
    acceptor: Option<thread::JoinHandle<()>>,
}

/// Plausible values for a three-zone heat pump installation.
pub fn reference_values(zone_count: u8) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let mut put = |k: &str, v: &str| {
        values.insert(k.to_string(), v.to_string());
    };
    put(m::HOTWATER_OP_MODE, "auto");
    put(m::HOTWATER_TEMP_DESIRED, "50.0");
    put(m::HOTWATER_STORAGE_TEMP, "44.5");
    put(m::HOTWATER_SF_MODE, "auto");
    put(m::STATUS_TIME, "10:15:00;19.10.2026");
    put(m::STATUS_OUTSIDE_TEMP, "8.3");
    put(m::STATUS_SYSTEM_FLOW_TEMP, "34.1");
    put(m::STATUS_WATER_PRESSURE, "1.8");
    put(m::STATUS_CURRENT_CONSUMED_POWER, "1.2");
    put(m::STATUS_STATUS01, "33.0;30.5;-;-;-;on");
    put(m::STATUS_STATE, "Heating");

    for index in 1..=zone_count {
        let z = |name: &str| zone_value(index, name);
        values.insert(z(m::ZONE_OP_MODE), "auto".into());
        values.insert(z(m::ZONE_SF_MODE), "auto".into());
        values.insert(z(m::ZONE_ROOM_TEMP_DESIRED), "20.5".into());
        values.insert(z(m::ZONE_ROOM_TEMP), "20.1".into());
        values.insert(z(m::ZONE_QUICK_VETO_TEMP), "21.0".into());
        values.insert(z(m::ZONE_QUICK_VETO_END_DATE), "-".into());
        values.insert(z(m::ZONE_QUICK_VETO_END_TIME), "-".into());
        values.insert(z(m::ZONE_QUICK_VETO_DURATION), "0.5".into());
        values.insert(z(m::ZONE_SHORT_NAME), format!("Z{}", index));
        values.insert(z(m::ZONE_NAME1), "Zone".into());
        values.insert(z(m::ZONE_NAME2), format!(" {}", index));
    }
    values
}

fn lock(state: &Mutex<DaemonState>) -> MutexGuard<'_, DaemonState> {
    // a panicking connection thread must not take the whole daemon down
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FakeDaemon {
    /// Listen on an ephemeral loopback port, preloaded with [`reference_values`] for three zones.
    pub fn start() -> Self {
        Self::start_on("127.0.0.1:0", m::DEFAULT_ZONE_COUNT).unwrap_or_else(|e| panic!("fake ebusd failed to bind: {}", e))
    }

    pub fn start_on(bind: &str, zone_count: u8) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind)?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(DaemonState {
            values: reference_values(zone_count),
            ..Default::default()
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::spawn(move || accept_loop(listener, state, stop))
        };
        debug!("Fake ebusd listening on {}", addr);
        Ok(FakeDaemon {
            addr,
            state,
            stop,
            acceptor: Some(acceptor),
        })
    }

    /// Let temperatures drift a little on every read.
    pub fn with_noise(self, seed: u64) -> Self {
        lock(&self.state).noise = Some(SmallRng::seed_from_u64(seed));
        self
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn controller(&self) -> &'static str {
        CONTROLLER
    }

    pub fn set_value(&self, name: &str, value: &str) {
        lock(&self.state).values.insert(name.to_string(), value.to_string());
    }

    pub fn remove_value(&self, name: &str) {
        lock(&self.state).values.remove(name);
    }

    pub fn value(&self, name: &str) -> Option<String> {
        lock(&self.state).values.get(name).cloned()
    }

    /// Queue raw answers for `name`; each is used once, in order.
    pub fn script(&self, name: &str, answers: &[&str]) {
        let mut state = lock(&self.state);
        let queue = state.scripted.entry(name.to_string()).or_default();
        queue.extend(answers.iter().map(|a| a.to_string()));
    }

    pub fn reads_of(&self, name: &str) -> usize {
        lock(&self.state).reads.get(name).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        lock(&self.state).reads.values().sum()
    }

    pub fn writes(&self) -> Vec<String> {
        lock(&self.state).writes.clone()
    }

    /// Hang up on `write` commands without acknowledging them.
    pub fn refuse_writes(&self, refuse: bool) {
        lock(&self.state).refuse_writes = refuse;
    }

    /// Close the connection after every answer, like a daemon restarting between requests.
    pub fn hang_up_after_answer(&self, hang_up: bool) {
        lock(&self.state).hang_up_after_answer = hang_up;
    }

    /// Answer `scan result` with nothing but the terminating blank line.
    pub fn empty_scan(&self, empty: bool) {
        lock(&self.state).empty_scan = empty;
    }

    /// Connections accepted since start.
    pub fn connections(&self) -> u64 {
        lock(&self.state).accepted
    }

    /// Connections currently being served.
    pub fn open_connections(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Close every open client connection, as a daemon restart would.
    pub fn drop_connections(&self) {
        let live = std::mem::take(&mut lock(&self.state).live);
        for stream in live.into_values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.drop_connections();
        // wake the accept loop so it sees the stop flag and releases the port
        let _ = TcpStream::connect(self.addr);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

fn accept_loop(listener: TcpListener, state: Arc<Mutex<DaemonState>>, stop: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("Fake ebusd accept failed: {}", e);
                continue;
            }
        };
        let id = {
            let mut state = lock(&state);
            state.accepted += 1;
            let id = state.accepted;
            if let Ok(clone) = stream.try_clone() {
                state.live.insert(id, clone);
            }
            id
        };
        let state = Arc::clone(&state);
        thread::spawn(move || serve(id, stream, state));
    }
}

fn serve(id: u64, stream: TcpStream, state: Arc<Mutex<DaemonState>>) {
    if let Ok(mut writer) = stream.try_clone() {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let Some(answer) = respond(&state, line.trim()) else {
                break;
            };
            if writer.write_all(answer.as_bytes()).is_err() || lock(&state).hang_up_after_answer {
                break;
            }
        }
        let _ = writer.shutdown(Shutdown::Both);
    }
    // the clone in `live` would otherwise keep the socket open
    lock(&state).live.remove(&id);
}

/// Raw bytes to send back, or `None` to hang up.
fn respond(state: &Mutex<DaemonState>, command: &str) -> Option<String> {
    let mut words = command.split_whitespace();
    match words.next() {
        Some("scan") if lock(state).empty_scan => Some("\n".to_string()),
        Some("scan") => Some(format!(
            "08;Vaillant;HMU00;0902;5103\n{};Vaillant;CTLV2;0507;1704\n\n",
            CONTROLLER
        )),
        Some("find") => {
            let name = words.last().unwrap_or_default();
            let state = lock(state);
            match state.values.get(name) {
                Some(v) => Some(format!("{} {} = {}\n", CONTROLLER, name, v)),
                None => Some(format!("{}\n", crate::session::ERR_ELEMENT_NOT_FOUND)),
            }
        }
        Some("read") => {
            let name = words.last().unwrap_or_default().to_string();
            Some(read_answer(&mut lock(state), &name))
        }
        Some("write") => {
            let args = words.collect::<Vec<_>>();
            let mut state = lock(state);
            if state.refuse_writes {
                return None;
            }
            state.writes.push(args.join(" "));
            let (name, value) = match args.as_slice() {
                ["-c", _, name, value] | [name, value] => (name.to_string(), value.to_string()),
                _ => return Some("ERR: invalid argument\n\n".to_string()),
            };
            apply_write(&mut state, &name, &value);
            Some("done\n".to_string())
        }
        _ => Some("ERR: command not found\n\n".to_string()),
    }
}

fn read_answer(state: &mut DaemonState, name: &str) -> String {
    *state.reads.entry(name.to_string()).or_default() += 1;

    let scripted = state.scripted.get_mut(name).and_then(|q| q.pop_front());
    let value = match scripted {
        Some(v) => v,
        None => match state.values.get(name).cloned() {
            Some(v) => drift(state, name, v),
            None => crate::session::ERR_ELEMENT_NOT_FOUND.to_string(),
        },
    };

    if value.starts_with(crate::session::ERR_PREFIX) {
        format!("{}\n\n", value)
    } else {
        format!("{}\n", value)
    }
}

fn drift(state: &mut DaemonState, name: &str, value: String) -> String {
    let Some(rng) = state.noise.as_mut() else {
        return value;
    };
    let drifts = name == m::HOTWATER_STORAGE_TEMP || name == m::STATUS_OUTSIDE_TEMP || name.ends_with(m::ZONE_ROOM_TEMP);
    match value.parse::<f64>() {
        Ok(v) if drifts => {
            let next = v + rng.random_range(-0.3..=0.3);
            let next = format!("{:.1}", next);
            state.values.insert(name.to_string(), next.clone());
            next
        }
        _ => value,
    }
}

/// Mirror the controller's reaction to a write on the values it reports back.
fn apply_write(state: &mut DaemonState, name: &str, value: &str) {
    info!("Fake ebusd: {} <- {}", name, value);
    state.values.insert(name.to_string(), value.to_string());
    if let Some(zone_prefix) = name.strip_suffix(m::ZONE_QUICK_VETO_DURATION) {
        state.values.insert(format!("{}{}", zone_prefix, m::ZONE_SF_MODE), "veto".to_string());
    }
}
