use ebusd_quickmode::client::EbusClient;
use ebusd_quickmode::config::{self, Config};
use ebusd_quickmode::services::watch;
use ebusd_quickmode::session::EbusError;
use ebusd_quickmode::simulator::FakeDaemon;
use log::{error, info, warn};
use std::path::PathBuf;

const USAGE: &str = "usage: ebusd-quickmode [--env-file PATH] [--simulate] \
[status | check | power | boost start|stop | veto start|stop | quickmode start|stop | watch]";

const SIMULATION_SEED: u64 = 0x00EB_0575_D0D0_CAFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Check,
    Power,
    Boost(Action),
    Veto(Action),
    QuickMode(Action),
    Watch,
}

#[derive(Debug, PartialEq)]
struct Cli {
    env_file: Option<PathBuf>,
    simulate: bool,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli, String> {
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;
    let mut simulate = false;
    let mut words: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        let path = match arg.as_str() {
            "--env-file" => Some(args.next().ok_or_else(|| "`--env-file` requires a path argument".to_string())?),
            s if s.starts_with("--env-file=") => Some(s["--env-file=".len()..].to_string()),
            "--simulate" => {
                simulate = true;
                None
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            s if s.starts_with('-') => return Err(format!("unrecognised argument: {}\n{}", s, USAGE)),
            _ => {
                words.push(arg);
                None
            }
        };
        if let Some(path) = path {
            if path.is_empty() {
                return Err("`--env-file` requires a path argument".to_string());
            }
            if env_file.replace(PathBuf::from(path)).is_some() {
                return Err("`--env-file` provided more than once".to_string());
            }
        }
    }

    let action = |word: Option<&str>| match word {
        Some("start") => Ok(Action::Start),
        Some("stop") => Ok(Action::Stop),
        _ => Err(format!("expected `start` or `stop`\n{}", USAGE)),
    };
    let words = words.iter().map(String::as_str).collect::<Vec<_>>();
    let command = match words.as_slice() {
        [] | ["status"] => Command::Status,
        ["check"] => Command::Check,
        ["power"] => Command::Power,
        ["watch"] => Command::Watch,
        ["boost", rest @ ..] if rest.len() <= 1 => Command::Boost(action(rest.first().copied())?),
        ["veto", rest @ ..] if rest.len() <= 1 => Command::Veto(action(rest.first().copied())?),
        ["quickmode", rest @ ..] if rest.len() <= 1 => Command::QuickMode(action(rest.first().copied())?),
        other => {
            return Err(format!("unknown command: {}\n{}", other.join(" "), USAGE));
        }
    };

    Ok(Cli {
        env_file,
        simulate,
        command,
    })
}

/// Load the explicit env file, or `./.env` if present. Returns the path that was loaded.
fn load_env(cli: &Cli) -> Result<Option<(PathBuf, bool)>, String> {
    if let Some(path) = &cli.env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        config::load_env_file(path)?;
        return Ok(Some((path.clone(), true)));
    }
    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if default_path.is_file() {
        config::load_env_file(&default_path)?;
        Ok(Some((default_path, false)))
    } else {
        Ok(None)
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (update_interval={}s, zones={}, default_zone={}, strategy={:?}, quickmode_zone={}, io_timeout={})",
        cfg.update_interval.as_secs(),
        cfg.zone_count,
        cfg.default_zone,
        cfg.strategy,
        cfg.quickmode_zone,
        cfg.io_timeout
            .map(|t| format!("{}s", t.as_secs()))
            .unwrap_or_else(|| "-".to_string()),
    );

    // 2) Pick the daemon: a local simulator or the configured ebusd
    let simulator = if cli.simulate {
        let daemon = FakeDaemon::start_on("127.0.0.1:0", cfg.zone_count)
            .map_err(|e| format!("Starting simulated ebusd failed: {}", e))?
            .with_noise(SIMULATION_SEED);
        info!("Simulated ebusd listening on {}", daemon.address());
        Some(daemon)
    } else {
        None
    };
    let address = match &simulator {
        Some(daemon) => daemon.address(),
        None => cfg.ebusd_address.clone().ok_or_else(|| {
            format!(
                "Missing ebusd address: set EBUSD_ADDRESS or provide {} in the working directory",
                config::DEFAULT_PAR_FILE
            )
        })?,
    };

    // 3) Connect and resolve the controller
    let mut client = EbusClient::connect(address.clone(), cfg.client_options())
        .map_err(|e| format!("Connecting to ebusd at {} failed: {}", address, e))?;

    // 4) Run the command
    match cli.command {
        Command::Status => {
            let snapshot = client.get_snapshot(true).map_err(|e| format!("Reading system state failed: {}", e))?;
            let json = serde_json::to_string_pretty(&snapshot).map_err(|e| format!("serialize snapshot failed: {}", e))?;
            println!("{}", json);
            if let Some(path) = &cfg.system_file {
                watch::write_system_file(path, &snapshot, client.mode_state())?;
                info!("System info written to {}", path.display());
            }
        }
        Command::Check => match client.check_configuration() {
            Ok(report) => {
                print!("{}", report);
                info!("ebusd configuration looks complete");
            }
            Err(EbusError::ElementNotFound { names, report }) => {
                print!("{}", report);
                return Err(format!("ebusd does not know {} value(s): {}", names.len(), names.join(", ")));
            }
            Err(e) => return Err(format!("Configuration check failed: {}", e)),
        },
        Command::Power => {
            let watts = client.current_power_watts().map_err(|e| format!("Reading power failed: {}", e))?;
            println!("Current power consumption: {:.0} W", watts);
        }
        Command::Boost(Action::Start) => {
            client.start_hotwater_boost().map_err(|e| format!("Starting hot water boost failed: {}", e))?;
            println!("Hot water boost started");
        }
        Command::Boost(Action::Stop) => {
            client.stop_hotwater_boost().map_err(|e| format!("Stopping hot water boost failed: {}", e))?;
            println!("Hot water boost stopped");
        }
        Command::Veto(Action::Start) => {
            let request = cfg.veto_request();
            client.start_zone_veto(&request).map_err(|e| format!("Starting zone quick veto failed: {}", e))?;
            println!(
                "Quick veto started in zone {} ({:.1} °C for {:.1} h)",
                request.zone_or(cfg.default_zone),
                request.setpoint_or_default(),
                request.duration_or_default()
            );
        }
        Command::Veto(Action::Stop) => {
            client
                .stop_zone_veto(Some(cfg.quickmode_zone))
                .map_err(|e| format!("Stopping zone quick veto failed: {}", e))?;
            println!("Quick veto stopped in zone {}", cfg.quickmode_zone);
        }
        Command::QuickMode(Action::Start) => {
            let outcome = client
                .start_by_strategy(cfg.strategy, &cfg.veto_request())
                .map_err(|e| format!("Starting quick mode failed: {}", e))?;
            println!("{}", outcome);
            if let Some(expires) = client.quick_mode_expires_at(Some(cfg.quickmode_zone)) {
                println!("Quick veto ends {}", expires);
            }
        }
        Command::QuickMode(Action::Stop) => {
            let stopped = client
                .stop_by_strategy(Some(cfg.quickmode_zone))
                .map_err(|e| format!("Stopping quick mode failed: {}", e))?;
            if stopped.is_active() {
                println!("Quick mode \"{}\" stopped", stopped);
            } else {
                println!("No quick mode was running");
            }
        }
        Command::Watch => {
            info!(
                "Starting watch loop: interval={}s, system_file={}",
                cfg.watch_interval.as_secs(),
                cfg.system_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            watch::run_loop(&mut client, cfg.watch_interval, cfg.system_file.as_deref(), None)?;
        }
    }

    if simulator.is_some() {
        warn!("Changes above were made on the simulated daemon only");
    }
    Ok(())
}

fn main() {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(2);
        }
    };
    let loaded_env = match load_env(&cli) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some((path, explicit)) = loaded_env.as_ref() {
        let origin = if *explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, path.display());
    }

    info!(
        "ebusd-quickmode {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
