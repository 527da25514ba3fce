//! Shared rig for integration tests.
//!
//! Records every sleep and event so tests can assert on dispense timing and
//! the operator-facing event stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use robotaste_pumps::adapters::sim::{SimConnector, SimHandle};
use robotaste_pumps::app::events::AppEvent;
use robotaste_pumps::app::ports::{EventSink, TimePort};
use robotaste_pumps::app::service::DispenseService;
use robotaste_pumps::config::{PumpAddressConfig, PumpConfig, ServiceConfig};
use robotaste_pumps::pool::PumpPool;
use robotaste_pumps::store::Store;

pub const PROTOCOL: &str = "p1";
pub const SESSION: &str = "s1";

// ── Clock ─────────────────────────────────────────────────────

/// Never blocks.  Time advances by exactly the amount slept.
pub struct RecordingClock {
    start: DateTime<Utc>,
    sleeps: Mutex<Vec<Duration>>,
}

#[allow(dead_code)]
impl RecordingClock {
    pub fn new() -> Self {
        Self {
            start: Utc::now(),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Sleeps long enough to be pump motion rather than retry backoff.
    pub fn motion_secs(&self) -> Vec<f64> {
        self.sleeps
            .lock()
            .iter()
            .filter(|d| d.as_secs_f64() >= 1.0)
            .map(Duration::as_secs_f64)
            .collect()
    }
}

impl TimePort for RecordingClock {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }

    fn now(&self) -> DateTime<Utc> {
        let slept: Duration = self.sleeps.lock().iter().sum();
        self.start + chrono::Duration::from_std(slept).unwrap_or_default()
    }
}

// ── Event sink ────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<AppEvent>,
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &AppEvent) {
        self.events.push(event.clone());
    }
}

// ── Rig ───────────────────────────────────────────────────────

pub struct Rig {
    pub store: Store,
    pub pool: PumpPool,
    pub service: DispenseService,
    pub clock: Arc<RecordingClock>,
    pub connector: Arc<SimConnector>,
    pub sink: RecordingSink,
    pub config: PumpConfig,
}

#[allow(dead_code)]
impl Rig {
    pub fn new(config: PumpConfig) -> Self {
        Self::with_service(config, ServiceConfig::default())
    }

    pub fn with_service(config: PumpConfig, service_config: ServiceConfig) -> Self {
        let store = Store::open_in_memory().unwrap();
        store.upsert_protocol(PROTOCOL, "Test protocol", &config).unwrap();
        store.register_session(SESSION, PROTOCOL).unwrap();

        let clock = Arc::new(RecordingClock::new());
        let connector = Arc::new(SimConnector::new());
        let pool = PumpPool::new(connector.clone(), clock.clone(), 2, 50);
        let service = DispenseService::new(&service_config, clock.clone());
        Self {
            store,
            pool,
            service,
            clock,
            connector,
            sink: RecordingSink::default(),
            config,
        }
    }

    /// Emulator behind the protocol's serial port.
    pub fn sim(&self) -> SimHandle {
        self.connector.handle(&self.config.serial_port)
    }

    pub fn enqueue(&self, cycle: i64, recipe: &[(&str, f64)]) -> i64 {
        self.store
            .enqueue_dispense(SESSION, cycle, None, &recipe_of(recipe))
            .unwrap()
    }

    pub fn tick(&mut self) -> bool {
        self.service
            .tick(&mut self.pool, &self.store, &mut self.sink)
            .unwrap()
    }
}

pub fn recipe_of(items: &[(&str, f64)]) -> BTreeMap<String, f64> {
    items.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

/// Sugar on address 0, Water (diluent) on 1, 10 mL total, 2000 µL/min.
pub fn sugar_and_water() -> PumpConfig {
    let mut water = PumpAddressConfig::new(1, "Water", 26.59);
    water.is_diluent = true;
    PumpConfig {
        total_volume_ml: Some(10.0),
        pumps: vec![PumpAddressConfig::new(0, "Sugar", 26.59), water],
        ..PumpConfig::default()
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}
