//! Runtime configuration from the environment, with an optional parameter file for the daemon address.

use crate::cache::DEFAULT_UPDATE_INTERVAL;
use crate::client::ClientOptions;
use crate::models::ebus::{DEFAULT_ZONE_COUNT, DEFAULT_ZONE_INDEX, Strategy, VetoRequest};
use crate::session::{DEFAULT_READ_ATTEMPTS, DEFAULT_RETRY_BACKOFF, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

pub const DEFAULT_PAR_FILE: &str = ".ebusd-par.json";
pub const DEFAULT_WATCH_SECS: u64 = 30;
pub const DEFAULT_QUICKMODE_ZONE: u8 = 1;

/// Contents of the parameter file, e.g. `{"ebusdaddress": "192.168.1.20:8888"}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ParFile {
    #[serde(rename = "ebusdaddress")]
    pub ebusd_address: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` of ebusd; `None` when neither the environment nor the parameter file names one.
    pub ebusd_address: Option<String>,
    pub update_interval: Duration,
    pub zone_count: u8,
    pub default_zone: u8,
    pub io_timeout: Option<Duration>,
    pub retry_backoff: Duration,
    pub strategy: Strategy,
    /// Zone targeted by `veto` and `quickmode` commands.
    pub quickmode_zone: u8,
    pub veto_setpoint: Option<f64>,
    pub veto_duration_hours: Option<f64>,
    /// Where `status` and `watch` dump the snapshot as JSON.
    pub system_file: Option<PathBuf>,
    pub watch_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let ebusd_address = match get("EBUSD_ADDRESS") {
            Some(addr) => Some(addr),
            None => {
                let path = get("EBUSD_PAR_FILE").unwrap_or_else(|| DEFAULT_PAR_FILE.to_string());
                let path = Path::new(&path);
                if path.is_file() {
                    Some(read_par_file(path)?.ebusd_address)
                } else {
                    None
                }
            }
        };

        let update_secs = parse_or(&get, "EBUSD_UPDATE_INTERVAL_SECS", DEFAULT_UPDATE_INTERVAL.as_secs())?;
        let zone_count = parse_or(&get, "EBUSD_ZONE_COUNT", DEFAULT_ZONE_COUNT)?;
        let default_zone = parse_or(&get, "EBUSD_DEFAULT_ZONE", DEFAULT_ZONE_INDEX)?;
        let io_timeout = parse_opt::<u64>(&get, "EBUSD_IO_TIMEOUT_SECS")?
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        let backoff_ms = parse_or(&get, "EBUSD_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF.as_millis() as u64)?;

        let strategy = match get("QUICKMODE_STRATEGY") {
            Some(s) => s
                .parse::<Strategy>()
                .map_err(|e| format!("QUICKMODE_STRATEGY: {} (expected hotwater, heating or hotwater_then_heating)", e))?,
            None => Strategy::HotwaterThenHeating,
        };
        let quickmode_zone = parse_or(&get, "QUICKMODE_ZONE", DEFAULT_QUICKMODE_ZONE)?;
        let veto_setpoint = parse_opt::<f64>(&get, "QUICKMODE_VETO_SETPOINT")?;
        let veto_duration_hours = parse_opt::<f64>(&get, "QUICKMODE_VETO_DURATION")?;

        let watch_secs = parse_or(&get, "WATCH_INTERVAL_SECS", DEFAULT_WATCH_SECS)?;
        if watch_secs == 0 {
            return Err("WATCH_INTERVAL_SECS must be positive".to_string());
        }

        Ok(Config {
            ebusd_address,
            update_interval: Duration::from_secs(update_secs),
            zone_count,
            default_zone,
            io_timeout,
            retry_backoff: Duration::from_millis(backoff_ms),
            strategy,
            quickmode_zone,
            veto_setpoint,
            veto_duration_hours,
            system_file: get("SYSTEM_FILE").map(PathBuf::from),
            watch_interval: Duration::from_secs(watch_secs),
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            update_interval: self.update_interval,
            zone_count: self.zone_count,
            default_zone: self.default_zone,
            retry: RetryPolicy {
                max_attempts: DEFAULT_READ_ATTEMPTS,
                backoff: self.retry_backoff,
            },
            io_timeout: self.io_timeout,
        }
    }

    pub fn veto_request(&self) -> VetoRequest {
        VetoRequest {
            zone: Some(self.quickmode_zone),
            setpoint: self.veto_setpoint,
            duration_hours: self.veto_duration_hours,
        }
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|v| v.parse::<T>().map_err(|e| format!("{} = {:?}: {}", key, v, e)))
        .transpose()
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

pub fn read_par_file(path: &Path) -> Result<ParFile, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_par_file(&raw).map_err(|e| format!("{}: {}", path.display(), e))
}

fn parse_par_file(raw: &str) -> Result<ParFile, String> {
    let de = &mut serde_json::Deserializer::from_str(raw);
    let pars: ParFile = serde_path_to_error::deserialize(de).map_err(|e| format!("invalid parameter file at {}: {}", e.path(), e.inner()))?;
    if pars.ebusd_address.trim().is_empty() {
        return Err("ebusdaddress is empty".to_string());
    }
    Ok(pars)
}

// =====================
// .env files
// =====================

/// Apply `KEY=value` lines from `path` to the process environment. Variables already set win.
pub fn load_env_file(path: &Path) -> Result<usize, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut applied = 0;
    for (index, line) in raw.lines().enumerate() {
        let Some((key, value)) = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))? else {
            continue;
        };
        if env::var_os(&key).is_none() {
            // SAFETY: called from `main` before any other thread is started.
            unsafe {
                env::set_var(&key, value);
            }
            applied += 1;
        }
    }
    Ok(applied)
}

/// One `.env` line: blank and `#` lines are skipped, `export ` is allowed, values may be quoted.
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(format!("invalid variable name {:?}", key));
    }

    let value = value.trim();
    let value = match value.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let rest = &value[1..];
            let end = rest.find(q).ok_or_else(|| format!("unterminated {} quote", q))?;
            let tail = rest[end + 1..].trim();
            if !(tail.is_empty() || tail.starts_with('#')) {
                return Err("unexpected characters after closing quote".to_string());
            }
            rest[..end].to_string()
        }
        _ => value.split(" #").next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}
