//! Network command burst builder.
//!
//! A burst packs commands for several pumps into one line that every pump on
//! the chain executes at once:
//!
//! ```text
//! 0 DIA 26.59 * 1 DIA 26.59 *
//! ```
//!
//! Addresses are limited to `0..=9` in this mode.  The combined reply is
//! officially unusable, so it is only scanned for known fault markers
//! (`OOR`).  Anything else unusual is logged as a warning and the burst is
//! otherwise assumed to have landed.
//!
//! The pumps only apply one parameter type reliably per burst, so the
//! separated form is what the dispense path uses:
//!
//! 1. diameter, rate, volume unit, direction (once per session)
//! 2. volume (every cycle)
//! 3. run

use log::{debug, warn};

use crate::codec::{
    Direction, MAX_RATE_UL_MIN, RateUnit, VolumeUnit, format_diameter, format_rate, format_volume,
};
use crate::error::{PumpError, Result};

use super::pump::PumpDriver;

/// Highest address usable in a burst.
pub const MAX_BURST_ADDRESS: u8 = 9;
pub const MIN_DIAMETER_MM: f64 = 0.1;
pub const MAX_DIAMETER_MM: f64 = 50.0;
const MAX_UL_FIELD: f64 = 9999.0;

/// Out-of-range marker, the one fault code recognisable in a burst reply.
const OUT_OF_RANGE: &str = "OOR";

/// Per-pump parameters for one burst cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct BurstPumpConfig {
    pub address: u8,
    pub rate_ul_min: f64,
    /// Requested ingredient volume.  Halved on the wire for dual syringes.
    pub volume_ul: f64,
    pub diameter_mm: f64,
    pub direction: Direction,
    pub volume_unit: VolumeUnit,
    pub dual_syringe: bool,
}

impl BurstPumpConfig {
    pub fn commanded_volume_ul(&self) -> f64 {
        if self.dual_syringe {
            self.volume_ul / 2.0
        } else {
            self.volume_ul
        }
    }
}

/// Collect every violation instead of stopping at the first.
pub fn validate_burst(pumps: &[BurstPumpConfig]) -> Vec<String> {
    validate(pumps, true)
}

fn validate(pumps: &[BurstPumpConfig], with_volume: bool) -> Vec<String> {
    let mut errors = Vec::new();
    if pumps.is_empty() {
        errors.push("no pumps in burst".to_string());
    }

    let mut seen: Vec<u8> = Vec::with_capacity(pumps.len());
    for p in pumps {
        if p.address > MAX_BURST_ADDRESS {
            errors.push(format!(
                "address {} out of burst range 0-{MAX_BURST_ADDRESS}",
                p.address
            ));
        }
        if seen.contains(&p.address) {
            errors.push(format!("duplicate address {}", p.address));
        } else {
            seen.push(p.address);
        }
        if !(p.rate_ul_min.is_finite() && p.rate_ul_min > 0.0) {
            errors.push(format!("pump {}: rate must be positive", p.address));
        } else if p.rate_ul_min > MAX_RATE_UL_MIN {
            errors.push(format!(
                "pump {}: rate {} uL/min exceeds the field maximum {MAX_RATE_UL_MIN}",
                p.address, p.rate_ul_min
            ));
        }
        if with_volume && !(p.volume_ul.is_finite() && p.volume_ul > 0.0) {
            errors.push(format!("pump {}: volume must be positive", p.address));
        }
        if !(p.diameter_mm.is_finite() && p.diameter_mm > 0.0) {
            errors.push(format!("pump {}: diameter must be positive", p.address));
        } else if !(MIN_DIAMETER_MM..=MAX_DIAMETER_MM).contains(&p.diameter_mm) {
            errors.push(format!(
                "pump {}: diameter {} mm outside {MIN_DIAMETER_MM}-{MAX_DIAMETER_MM} mm",
                p.address, p.diameter_mm
            ));
        }
        if with_volume && p.volume_unit == VolumeUnit::Ul && p.commanded_volume_ul() > MAX_UL_FIELD {
            errors.push(format!(
                "pump {}: {} UL exceeds the 4-digit field (max {MAX_UL_FIELD})",
                p.address,
                p.commanded_volume_ul()
            ));
        }
    }
    errors
}

/// Builds burst lines for a validated set of pumps.
#[derive(Debug, Clone)]
pub struct BurstCommandBuilder {
    pumps: Vec<BurstPumpConfig>,
}

impl BurstCommandBuilder {
    pub fn new(pumps: Vec<BurstPumpConfig>) -> Result<Self> {
        let errors = validate_burst(&pumps);
        if errors.is_empty() {
            Ok(Self { pumps })
        } else {
            Err(PumpError::BurstValidation(errors))
        }
    }

    /// Builder for the one-time setup lines only.  Volumes are not checked,
    /// so every pump on the chain can be covered, including those with
    /// nothing to dispense this cycle.
    pub fn for_setup(pumps: Vec<BurstPumpConfig>) -> Result<Self> {
        let errors = validate(&pumps, false);
        if errors.is_empty() {
            Ok(Self { pumps })
        } else {
            Err(PumpError::BurstValidation(errors))
        }
    }

    pub fn pumps(&self) -> &[BurstPumpConfig] {
        &self.pumps
    }

    fn line<F>(&self, part: F) -> String
    where
        F: Fn(&BurstPumpConfig) -> String,
    {
        join(self.pumps.iter().map(|p| format!("{} {}", p.address, part(p))))
    }

    pub fn diameter(&self) -> String {
        self.line(|p| format!("DIA {}", format_diameter(p.diameter_mm)))
    }

    pub fn rate(&self) -> String {
        self.line(|p| {
            let (value, unit) = format_rate(p.rate_ul_min, RateUnit::UlPerMin);
            format!("RAT {value} {}", unit.code())
        })
    }

    pub fn volume_unit(&self) -> String {
        self.line(|p| format!("VOL {}", p.volume_unit.code()))
    }

    pub fn direction(&self) -> String {
        self.line(|p| format!("DIR {}", p.direction.code()))
    }

    pub fn volume(&self) -> String {
        self.line(|p| {
            let value = p.volume_unit.from_ul(p.commanded_volume_ul());
            format!("VOL {}", format_volume(value, p.volume_unit))
        })
    }

    pub fn run(&self) -> String {
        self.line(|_| "RUN".to_string())
    }

    pub fn stop(&self) -> String {
        self.line(|_| "STP".to_string())
    }

    /// One-time setup, in the order the pumps need it: direction and unit
    /// must be in place before the first volume value.
    pub fn setup_sequence(&self) -> [String; 4] {
        [
            self.diameter(),
            self.rate(),
            self.volume_unit(),
            self.direction(),
        ]
    }

    /// Every parameter for every pump in a single line.
    pub fn combined(&self) -> String {
        let parts = self.pumps.iter().flat_map(|p| {
            let (rate, rate_unit) = format_rate(p.rate_ul_min, RateUnit::UlPerMin);
            let volume = format_volume(
                p.volume_unit.from_ul(p.commanded_volume_ul()),
                p.volume_unit,
            );
            [
                format!("{} DIA {}", p.address, format_diameter(p.diameter_mm)),
                format!("{} RAT {rate} {}", p.address, rate_unit.code()),
                format!("{} DIR {}", p.address, p.direction.code()),
                format!("{} VOL {}", p.address, p.volume_unit.code()),
                format!("{} VOL {volume}", p.address),
            ]
        });
        join(parts)
    }

    /// Wait for the slowest pump of the cycle, buffer included.
    pub fn cycle_duration(&self) -> std::time::Duration {
        self.pumps
            .iter()
            .map(|p| super::pump::dispense_duration(p.commanded_volume_ul(), p.rate_ul_min))
            .max()
            .unwrap_or_default()
    }
}

fn join<I: Iterator<Item = String>>(parts: I) -> String {
    let mut out = parts.collect::<Vec<_>>().join(" * ");
    out.push_str(" *");
    out
}

/// Scan a burst reply for known faults.
///
/// `OOR` is the only code recognised; the rest of the reply is noise by
/// design, so other oddities only produce a warning.
pub fn check_burst_response(line: &str, response: &str, pumps: &[BurstPumpConfig]) -> Result<()> {
    if let Some(pos) = response.find(OUT_OF_RANGE) {
        let address = response[..pos]
            .chars()
            .rev()
            .find(char::is_ascii_digit)
            .and_then(|c| c.to_digit(10))
            .and_then(|d| u8::try_from(d).ok())
            .or_else(|| pumps.first().map(|p| p.address))
            .unwrap_or(0);
        return Err(PumpError::Command {
            address,
            command: line.to_string(),
            response: response.to_string(),
        });
    }
    if response.contains('?') {
        warn!("burst '{line}': unrecognised reply {response:?}; assuming applied");
    }
    Ok(())
}

/// Send one burst line on the bus owned by `driver` and scan the reply.
pub fn send_burst(driver: &PumpDriver, line: &str, pumps: &[BurstPumpConfig]) -> Result<()> {
    let response = driver.send_raw(&format!("{line}\r"))?;
    debug!("burst reply ({} bytes) scanned", response.len());
    check_burst_response(line, &response, pumps)
}
