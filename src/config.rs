//! Service and protocol configuration.
//!
//! Two layers:
//! - [`ServiceConfig`]: process-level knobs (database path, poll interval,
//!   retry policy), filled from CLI flags on top of defaults.
//! - [`PumpConfig`]: the pump section of an experiment protocol, persisted
//!   as JSON next to the protocol by the web application and resolved per
//!   operation.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{MAX_RATE_UL_MIN, VolumeUnit};
use crate::error::{PumpError, Result};
use crate::transport::SerialSettings;

/// Highest address the NE-4000 accepts on a network chain.
pub const MAX_PUMP_ADDRESS: u8 = 99;

// ---------------------------------------------------------------------------
// Service configuration
// ---------------------------------------------------------------------------

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warning => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            other => Err(format!(
                "invalid log level '{other}' (expected DEBUG, INFO, WARNING or ERROR)"
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Process-level configuration for the pump service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// SQLite database shared with the web application.
    pub db_path: PathBuf,
    /// Delay between queue polls (seconds).
    pub poll_interval_secs: f64,
    pub log_level: LogLevel,
    /// Attempts per pump command before giving up.
    pub max_retries: u32,
    /// Per-reply serial read deadline (milliseconds).
    pub response_timeout_ms: u64,
    /// Plunger rate used for refill withdraw/purge moves (µL/min).
    pub refill_rate_ul_min: f64,
    /// Fail a dispense before any I/O if tracked volume is insufficient.
    pub block_on_insufficient_volume: bool,
    /// Prune volume history older than this many days at start-up.
    pub history_retention_days: Option<u32>,
    /// Drive the in-process pump emulator instead of a serial port.
    pub simulate: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("robotaste.db"),
            poll_interval_secs: 0.5,
            log_level: LogLevel::Info,
            max_retries: 3,
            response_timeout_ms: 500,
            refill_rate_ul_min: 2000.0,
            block_on_insufficient_volume: false,
            history_retention_days: None,
            simulate: false,
        }
    }
}

impl ServiceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.poll_interval_secs.is_finite() && self.poll_interval_secs > 0.0) {
            return Err(PumpError::configuration("poll interval must be > 0 seconds"));
        }
        if self.max_retries == 0 {
            return Err(PumpError::configuration("max_retries must be at least 1"));
        }
        if self.response_timeout_ms == 0 {
            return Err(PumpError::configuration("response timeout must be > 0 ms"));
        }
        if !rate_in_range(self.refill_rate_ul_min) {
            return Err(PumpError::Configuration(format!(
                "refill rate must be in (0, {MAX_RATE_UL_MIN}] uL/min"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Protocol pump configuration
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    19_200
}

fn default_rate_ul_min() -> f64 {
    2000.0
}

fn default_volume_unit() -> VolumeUnit {
    VolumeUnit::Ml
}

fn default_syringe_capacity_ul() -> f64 {
    60_000.0
}

fn default_alert_threshold_ul() -> f64 {
    2000.0
}

/// One physical syringe on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpAddressConfig {
    pub address: u8,
    pub ingredient: String,
    #[serde(default)]
    pub syringe_diameter_mm: Option<f64>,
    #[serde(default = "default_volume_unit")]
    pub volume_unit: VolumeUnit,
    /// Two syringes on one pump head, both driven by the same address.
    #[serde(default)]
    pub dual_syringe: bool,
    #[serde(default)]
    pub stock_concentration: Option<f64>,
    /// Receives the remainder volume up to the protocol's total.
    #[serde(default)]
    pub is_diluent: bool,
    /// Capacity of a single syringe (µL).
    #[serde(default = "default_syringe_capacity_ul")]
    pub syringe_capacity_ul: f64,
    #[serde(default = "default_alert_threshold_ul")]
    pub alert_threshold_ul: f64,
}

impl PumpAddressConfig {
    pub fn new(address: u8, ingredient: impl Into<String>, diameter_mm: f64) -> Self {
        Self {
            address,
            ingredient: ingredient.into(),
            syringe_diameter_mm: Some(diameter_mm),
            volume_unit: default_volume_unit(),
            dual_syringe: false,
            stock_concentration: None,
            is_diluent: false,
            syringe_capacity_ul: default_syringe_capacity_ul(),
            alert_threshold_ul: default_alert_threshold_ul(),
        }
    }

    pub fn diameter_mm(&self) -> Result<f64> {
        self.syringe_diameter_mm.ok_or_else(|| {
            PumpError::Configuration(format!(
                "pump {:02} ({}): missing syringe diameter",
                self.address, self.ingredient
            ))
        })
    }

    /// Water is treated as the diluent even without the explicit flag.
    pub fn is_diluent_pump(&self) -> bool {
        self.is_diluent || self.ingredient.eq_ignore_ascii_case("water")
    }

    /// Volume the pump must be told to move for `requested_ul` of this
    /// ingredient.  Dual syringes each deliver half.
    pub fn commanded_volume_ul(&self, requested_ul: f64) -> f64 {
        if self.dual_syringe {
            requested_ul / 2.0
        } else {
            requested_ul
        }
    }

    /// Total liquid the address can hold.  Dual syringes hold twice as much.
    pub fn tracked_capacity_ul(&self) -> f64 {
        if self.dual_syringe {
            self.syringe_capacity_ul * 2.0
        } else {
            self.syringe_capacity_ul
        }
    }
}

/// Pump section of an experiment protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Total cup volume; the diluent tops each recipe up to this.
    #[serde(default)]
    pub total_volume_ml: Option<f64>,
    #[serde(default = "default_rate_ul_min")]
    pub dispensing_rate_ul_min: f64,
    #[serde(default = "default_true")]
    pub simultaneous_dispensing: bool,
    #[serde(default)]
    pub use_burst_mode: bool,
    #[serde(default)]
    pub pumps: Vec<PumpAddressConfig>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            total_volume_ml: None,
            dispensing_rate_ul_min: default_rate_ul_min(),
            simultaneous_dispensing: true,
            use_burst_mode: false,
            pumps: Vec::new(),
        }
    }
}

impl PumpConfig {
    pub fn pump_for_ingredient(&self, ingredient: &str) -> Option<&PumpAddressConfig> {
        self.pumps
            .iter()
            .find(|p| p.ingredient.eq_ignore_ascii_case(ingredient))
    }

    pub fn pump_for_address(&self, address: u8) -> Option<&PumpAddressConfig> {
        self.pumps.iter().find(|p| p.address == address)
    }

    pub fn diluent(&self) -> Option<&PumpAddressConfig> {
        self.pumps.iter().find(|p| p.is_diluent_pump())
    }

    pub fn total_volume_ul(&self) -> Option<f64> {
        self.total_volume_ml.filter(|v| *v > 0.0).map(|v| v * 1000.0)
    }

    /// Burst mode needs every address on a single digit and all pumps
    /// moving together.
    pub fn burst_eligible(&self) -> bool {
        self.use_burst_mode
            && self.simultaneous_dispensing
            && self.pumps.iter().all(|p| p.address <= 9)
    }

    pub fn serial_settings(&self, timeout_ms: u64) -> SerialSettings {
        SerialSettings::new(self.serial_port.clone(), self.baud_rate, timeout_ms)
    }
}

/// Positive, and narrow enough for the pump's rate field.
fn rate_in_range(rate_ul_min: f64) -> bool {
    rate_ul_min.is_finite() && rate_ul_min > 0.0 && rate_ul_min <= MAX_RATE_UL_MIN
}

/// Reject configurations that would send nonsense to the bus.  Invalid
/// values are rejected, never silently clamped.
pub fn validate_pump_config(cfg: &PumpConfig) -> Result<()> {
    if cfg.pumps.is_empty() {
        return Err(PumpError::configuration("no pumps configured"));
    }
    if cfg.serial_port.trim().is_empty() {
        return Err(PumpError::configuration("serial port is empty"));
    }
    if !rate_in_range(cfg.dispensing_rate_ul_min) {
        return Err(PumpError::Configuration(format!(
            "dispensing rate must be in (0, {MAX_RATE_UL_MIN}] uL/min"
        )));
    }
    if let Some(total) = cfg.total_volume_ml {
        if !(total.is_finite() && total >= 0.0) {
            return Err(PumpError::configuration("total volume must be >= 0"));
        }
    }

    let mut seen_addresses = Vec::with_capacity(cfg.pumps.len());
    let mut seen_ingredients: Vec<String> = Vec::with_capacity(cfg.pumps.len());
    for pump in &cfg.pumps {
        if pump.address > MAX_PUMP_ADDRESS {
            return Err(PumpError::Configuration(format!(
                "pump address {} out of range 0-{MAX_PUMP_ADDRESS}",
                pump.address
            )));
        }
        if seen_addresses.contains(&pump.address) {
            return Err(PumpError::Configuration(format!(
                "duplicate pump address {}",
                pump.address
            )));
        }
        seen_addresses.push(pump.address);

        let key = pump.ingredient.to_ascii_lowercase();
        if key.trim().is_empty() {
            return Err(PumpError::Configuration(format!(
                "pump {:02} has no ingredient name",
                pump.address
            )));
        }
        if seen_ingredients.contains(&key) {
            return Err(PumpError::Configuration(format!(
                "ingredient '{}' mapped to more than one pump",
                pump.ingredient
            )));
        }
        seen_ingredients.push(key);

        let diameter = pump.diameter_mm()?;
        if !(diameter.is_finite() && diameter > 0.0) {
            return Err(PumpError::Configuration(format!(
                "pump {:02} ({}): syringe diameter must be positive",
                pump.address, pump.ingredient
            )));
        }
        if pump.syringe_capacity_ul <= 0.0 {
            return Err(PumpError::Configuration(format!(
                "pump {:02} ({}): syringe capacity must be positive",
                pump.address, pump.ingredient
            )));
        }
    }

    if cfg.pumps.iter().filter(|p| p.is_diluent_pump()).count() > 1 {
        return Err(PumpError::configuration("more than one diluent pump configured"));
    }
    Ok(())
}
