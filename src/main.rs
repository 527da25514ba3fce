//! RoboTaste pump service: main entry point.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │                                                              │
//! │  SerialConnector / SimConnector   SystemClock   LogEventSink │
//! │  (PortConnector)                  (TimePort)    (EventSink)  │
//! │                                                              │
//! │  ──────────────── Port Trait Boundary ─────────────────      │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────┐      │
//! │  │       DispenseService (claim · dispense · track)   │      │
//! │  └────────────────────────────────────────────────────┘      │
//! │                                                              │
//! │  PumpPool (owned drivers) · Store (SQLite operation queue)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Single-threaded polling loop.  SIGINT/SIGTERM set a flag; the current
//! operation finishes, every pump is stopped and the process exits 0.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing_subscriber::filter::LevelFilter;

use robotaste_pumps::adapters::log_sink::LogEventSink;
use robotaste_pumps::adapters::serial::SerialConnector;
use robotaste_pumps::adapters::sim::SimConnector;
use robotaste_pumps::adapters::time::SystemClock;
use robotaste_pumps::app::events::AppEvent;
use robotaste_pumps::app::ports::{EventSink, PortConnector, TimePort};
use robotaste_pumps::app::service::DispenseService;
use robotaste_pumps::config::{LogLevel, PumpAddressConfig, PumpConfig, ServiceConfig};
use robotaste_pumps::pool::PumpPool;
use robotaste_pumps::store::Store;

const USAGE: &str = "\
usage: pump_service [options]

  --db-path PATH                  SQLite database (default robotaste.db)
  --poll-interval SECONDS         queue poll interval (default 0.5)
  --log-level LEVEL               DEBUG, INFO, WARNING or ERROR (default INFO)
  --history-retention-days DAYS   prune volume history older than DAYS at start-up
  --block-on-insufficient-volume  fail dispenses the tracked volume cannot cover
  --simulate                      drive the built-in pump emulator, not a serial port
  -h, --help                      show this help";

// ── Arguments ─────────────────────────────────────────────────

/// Parse command-line flags into a [`ServiceConfig`].  `Ok(None)` means
/// help was requested.
fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Option<ServiceConfig>, String> {
    let mut config = ServiceConfig::default();
    let mut args = args.into_iter();

    while let Some(flag) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("{name} needs a value\n\n{USAGE}"))
        };
        match flag.as_str() {
            "-h" | "--help" => return Ok(None),
            "--db-path" => config.db_path = PathBuf::from(value("--db-path")?),
            "--poll-interval" => {
                let raw = value("--poll-interval")?;
                config.poll_interval_secs = raw
                    .parse()
                    .map_err(|_| format!("--poll-interval: '{raw}' is not a number"))?;
            }
            "--log-level" => config.log_level = value("--log-level")?.parse::<LogLevel>()?,
            "--history-retention-days" => {
                let raw = value("--history-retention-days")?;
                config.history_retention_days = Some(
                    raw.parse()
                        .map_err(|_| format!("--history-retention-days: '{raw}' is not a day count"))?,
                );
            }
            "--block-on-insufficient-volume" => config.block_on_insufficient_volume = true,
            "--simulate" => config.simulate = true,
            other => return Err(format!("unknown argument '{other}'\n\n{USAGE}")),
        }
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(Some(config))
}

fn init_logging(level: LogLevel) -> Result<()> {
    let filter = match level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warning => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("logging init failed: {e}"))?;
    log::set_max_level(level.as_level_filter());
    Ok(())
}

// ── Simulation seed ───────────────────────────────────────────

/// A two-pump protocol with one queued dispense, so a dry run without a
/// database has something to do.
fn seed_demo(store: &Store) -> Result<()> {
    let mut water = PumpAddressConfig::new(1, "Water", 26.59);
    water.is_diluent = true;
    let pumps = PumpConfig {
        serial_port: "/dev/sim0".to_string(),
        total_volume_ml: Some(1.0),
        pumps: vec![PumpAddressConfig::new(0, "Sugar", 26.59), water],
        ..PumpConfig::default()
    };
    store.upsert_protocol("demo", "Simulated demo", &pumps)?;
    store.register_session("demo-session", "demo")?;
    let recipe = BTreeMap::from([("Sugar".to_string(), 250.0)]);
    let id = store.enqueue_dispense("demo-session", 1, None, &recipe)?;
    info!("simulate: queued demo dispense {id}");
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> ExitCode {
    let config = match parse_args(std::env::args().skip(1)) {
        Ok(Some(config)) => config,
        Ok(None) => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = init_logging(config.log_level) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &ServiceConfig) -> Result<()> {
    info!("RoboTaste pump service v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Database ───────────────────────────────────────────
    let store = if config.db_path.exists() {
        Store::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?
    } else if config.simulate {
        warn!(
            "{} not found, simulating against an in-memory database",
            config.db_path.display()
        );
        let store = Store::open_in_memory().context("opening in-memory database")?;
        seed_demo(&store)?;
        store
    } else {
        return Err(anyhow!("database {} does not exist", config.db_path.display()));
    };

    // ── 2. Adapters ───────────────────────────────────────────
    let connector: Arc<dyn PortConnector> = if config.simulate {
        Arc::new(SimConnector::new())
    } else {
        Arc::new(SerialConnector::new())
    };
    let clock: Arc<dyn TimePort> = Arc::new(SystemClock::new());
    let mut sink = LogEventSink::new();
    let mut pool = PumpPool::new(
        connector,
        clock.clone(),
        config.max_retries,
        config.response_timeout_ms,
    );
    let mut service = DispenseService::new(config, clock.clone());

    // ── 3. Shutdown signals ───────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("registering handler for signal {signal}"))?;
    }

    // ── 4. Poll loop ──────────────────────────────────────────
    service.startup(&store, &mut sink)?;
    sink.emit(&AppEvent::Started {
        db_path: config.db_path.display().to_string(),
        simulate: config.simulate,
    });

    let interval = config.poll_interval();
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = service.tick(&mut pool, &store, &mut sink) {
            error!("poll failed: {e}");
        }
        clock.sleep(interval);
    }

    service.shutdown(&mut pool, &mut sink);
    Ok(())
}
