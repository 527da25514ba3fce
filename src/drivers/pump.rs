//! NE-4000 syringe pump driver (one network address).
//!
//! Owns one addressed pump on a shared serial bus through a
//! connect / command / verify cycle:
//!
//! ```text
//! Disconnected ──connect()──▶ Connected(status) ──disconnect()──▶ Disconnected
//! ```
//!
//! Every parameter write is followed by a read-back.  A mismatch beyond the
//! tolerance is logged as an error but does not fail the call; the pump is
//! allowed some imprecision.  A rejected command (`?` / `S?`) fails
//! immediately once retries are exhausted.
//!
//! ## Stopping
//!
//! The pump does not stop by itself after a programmed volume.  Callers of
//! [`PumpDriver::dispense_volume`] with `wait = false` own the stop.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use regex::Regex;

use crate::app::ports::{PortConnector, TimePort};
use crate::codec::{
    self, CodecError, Direction, MAX_RATE_UL_MIN, PumpResponse, PumpStatus, RateUnit, VolumeUnit,
    format_diameter, format_rate, format_volume, max_rate_for_diameter, parse_response,
    response::strip_framing,
};
use crate::error::{PumpError, Result};
use crate::transport::{SerialSettings, SharedTransport};

/// Only one pump may be mid-open at a time, whatever the port.
static PORT_OPEN_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Dispense waits are padded by this factor; the pump gives no completion
/// signal.
pub const SAFETY_BUFFER: f64 = 1.1;

const DIAMETER_TOLERANCE_MM: f64 = 0.01;
const VOLUME_TOLERANCE_UL: f64 = 1.0;
const MIN_RATE_TOLERANCE_UL_MIN: f64 = 1.0;
/// Volumes below this are treated as zero.  A zero volume means "run
/// until stopped" on the pump.
const MIN_DISPENSE_UL: f64 = 1e-3;
/// Largest value a µL volume field can carry.
const MAX_UL_FIELD: f64 = 9999.0;

/// `I0.500W0.000ML`
static DISPENSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^I\s*(\d*\.?\d+)\s*W\s*(\d*\.?\d+)\s*([A-Za-z]{2})$")
        .expect("static regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Connected(PumpStatus),
}

/// Accumulated infused / withdrawn volume as reported by `DIS`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispensedVolumes {
    pub infused_ul: f64,
    pub withdrawn_ul: f64,
}

/// Wait needed to move `volume_ul` at `rate_ul_min`, including the safety
/// buffer.
pub fn dispense_duration(volume_ul: f64, rate_ul_min: f64) -> Duration {
    if rate_ul_min <= 0.0 || volume_ul <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(volume_ul / rate_ul_min * 60.0 * SAFETY_BUFFER)
}

pub struct PumpDriver {
    address: u8,
    settings: SerialSettings,
    clock: Arc<dyn TimePort>,
    max_retries: u32,
    bus: Option<SharedTransport>,
    state: DriverState,
    diameter_mm: Option<f64>,
    rate_ul_min: Option<f64>,
    volume_unit: Option<VolumeUnit>,
    direction: Option<Direction>,
}

impl PumpDriver {
    pub fn new(
        address: u8,
        settings: SerialSettings,
        clock: Arc<dyn TimePort>,
        max_retries: u32,
    ) -> Self {
        Self {
            address,
            settings,
            clock,
            max_retries: max_retries.max(1),
            bus: None,
            state: DriverState::Disconnected,
            diameter_mm: None,
            rate_ul_min: None,
            volume_unit: None,
            direction: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn port(&self) -> &str {
        &self.settings.port
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    pub fn diameter_mm(&self) -> Option<f64> {
        self.diameter_mm
    }

    pub fn rate_ul_min(&self) -> Option<f64> {
        self.rate_ul_min
    }

    /// The bus this driver talks on, for burst commands addressed to the
    /// whole chain.
    pub fn bus(&self) -> Option<SharedTransport> {
        self.bus.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Open the port and check the pump answers a stop command.
    pub fn connect(&mut self, connector: &dyn PortConnector) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let _guard = PORT_OPEN_LOCK.lock();
        self.bus = Some(connector.open(&self.settings)?);

        match self.send("STP", "") {
            Ok(reply) => {
                info!(
                    "pump {:02} connected on {} @ {} baud (status {})",
                    self.address,
                    self.settings.port,
                    self.settings.baud_rate,
                    reply.status.name()
                );
                Ok(())
            }
            Err(e) => {
                self.bus = None;
                self.state = DriverState::Disconnected;
                Err(PumpError::Connection(format!(
                    "pump {:02} on {} did not answer: {e}",
                    self.address, self.settings.port
                )))
            }
        }
    }

    /// Drop the bus handle.  Cached parameters are forgotten because the
    /// pump may be reconfigured by someone else before the next connect.
    pub fn disconnect(&mut self) {
        if self.bus.take().is_some() {
            info!("pump {:02} disconnected", self.address);
        }
        self.state = DriverState::Disconnected;
        self.diameter_mm = None;
        self.rate_ul_min = None;
        self.volume_unit = None;
        self.direction = None;
    }

    // ── Wire exchange ───────────────────────────────────────────

    fn exchange(&self, command: &str, args: &str) -> Result<PumpResponse> {
        let bus = self.bus.as_ref().ok_or_else(|| {
            PumpError::Connection(format!("pump {:02} is not connected", self.address))
        })?;
        let frame = codec::encode_command(self.address, command, args);
        let shown = frame.trim_end();

        let raw = {
            let mut bus = bus.lock();
            bus.clear_input()
                .and_then(|()| bus.write_all(frame.as_bytes()))
                .map_err(|e| {
                    PumpError::Connection(format!("write to {} failed: {e}", self.settings.port))
                })?;
            match bus.read_reply() {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Vec::new(),
                Err(e) => {
                    return Err(PumpError::Connection(format!(
                        "read from {} failed: {e}",
                        self.settings.port
                    )));
                }
            }
        };

        debug!(
            "pump {:02} -> {:?} <- {:?}",
            self.address,
            shown,
            strip_framing(&raw)
        );

        let command_text = shown.get(2..).unwrap_or_default().to_string();
        parse_response(&raw).map_err(|e| match e {
            CodecError::Rejected(response) => PumpError::Command {
                address: self.address,
                command: command_text,
                response,
            },
            CodecError::Empty | CodecError::Malformed(_) => PumpError::Timeout {
                address: self.address,
                command: command_text,
            },
        })
    }

    /// Send one command with retry and exponential backoff
    /// (`0.1 * 2^(attempt-1)` s).  Only timeouts and rejections retry.
    fn send(&mut self, command: &str, args: &str) -> Result<PumpResponse> {
        let mut attempt: u32 = 1;
        loop {
            match self.exchange(command, args) {
                Ok(reply) => {
                    self.state = DriverState::Connected(reply.status);
                    return Ok(reply);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = Duration::from_secs_f64(0.1 * f64::from(1u32 << (attempt - 1)));
                    warn!(
                        "pump {:02}: attempt {attempt}/{} failed ({e}); retrying in {:?}",
                        self.address, self.max_retries, backoff
                    );
                    self.clock.sleep(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a raw, pre-encoded line on this driver's bus and collect
    /// whatever comes back.  Used for burst commands.
    pub fn send_raw(&self, line: &str) -> Result<String> {
        let bus = self.bus.as_ref().ok_or_else(|| {
            PumpError::Connection(format!("pump {:02} is not connected", self.address))
        })?;
        let mut bus = bus.lock();
        let reply = bus
            .clear_input()
            .and_then(|()| bus.write_all(line.as_bytes()))
            .and_then(|()| bus.drain())
            .map_err(|e| PumpError::Connection(format!("burst on {} failed: {e}", self.settings.port)))?;
        let text = strip_framing(&reply);
        debug!("bus {} -> {:?} <- {:?}", self.settings.port, line.trim_end(), text);
        Ok(text)
    }

    // ── Parameters ──────────────────────────────────────────────

    pub fn set_diameter(&mut self, diameter_mm: f64) -> Result<()> {
        if !(diameter_mm.is_finite() && diameter_mm > 0.0) {
            return Err(PumpError::Configuration(format!(
                "pump {:02}: invalid syringe diameter {diameter_mm}",
                self.address
            )));
        }
        let sent = format_diameter(diameter_mm);
        self.send("DIA", &sent)?;
        self.diameter_mm = Some(diameter_mm);

        let expected = sent.parse::<f64>().unwrap_or(diameter_mm);
        if let Some(actual) = self.read_back("DIA").map(|r| r.value) {
            match actual {
                Some(v) if (v - expected).abs() > DIAMETER_TOLERANCE_MM => error!(
                    "pump {:02}: diameter read back {v} mm, expected {expected} mm",
                    self.address
                ),
                Some(_) => {}
                None => warn!("pump {:02}: diameter read-back had no value", self.address),
            }
        }
        Ok(())
    }

    pub fn set_rate(&mut self, rate_ul_min: f64) -> Result<()> {
        if !(rate_ul_min.is_finite() && rate_ul_min > 0.0 && rate_ul_min <= MAX_RATE_UL_MIN) {
            return Err(PumpError::Configuration(format!(
                "pump {:02}: invalid rate {rate_ul_min} uL/min (max {MAX_RATE_UL_MIN})",
                self.address
            )));
        }
        if let Some(d) = self.diameter_mm {
            let max = max_rate_for_diameter(d);
            if rate_ul_min > max {
                warn!(
                    "pump {:02}: rate {rate_ul_min} uL/min exceeds ~{max:.0} uL/min for a {d} mm syringe",
                    self.address
                );
            }
        }

        let (value, unit) = format_rate(rate_ul_min, RateUnit::UlPerMin);
        self.send("RAT", &format!("{value} {}", unit.code()))?;
        self.rate_ul_min = Some(rate_ul_min);

        let expected = value
            .parse::<f64>()
            .map_or(rate_ul_min, |v| unit.to_ul_per_min(v));
        if let Some(reply) = self.read_back("RAT") {
            let actual = reply.value.map(|v| {
                reply
                    .unit
                    .as_deref()
                    .and_then(RateUnit::from_code)
                    .unwrap_or(unit)
                    .to_ul_per_min(v)
            });
            let tolerance = (expected * 0.01).max(MIN_RATE_TOLERANCE_UL_MIN);
            match actual {
                Some(v) if (v - expected).abs() > tolerance => error!(
                    "pump {:02}: rate read back {v} uL/min, expected {expected} uL/min",
                    self.address
                ),
                Some(_) => {}
                None => warn!("pump {:02}: rate read-back had no value", self.address),
            }
        }
        Ok(())
    }

    /// Switch the pump's volume units (`VOL ML` / `VOL UL`).
    ///
    /// Always sent: another driver on the same address may have changed the
    /// unit since this one last did.
    pub fn set_volume_unit(&mut self, unit: VolumeUnit) -> Result<()> {
        self.send("VOL", unit.code())?;
        self.volume_unit = Some(unit);
        Ok(())
    }

    /// Program the volume to move.  µL volumes too wide for the field are
    /// sent in mL instead.
    pub fn set_volume(&mut self, volume_ul: f64, unit: VolumeUnit) -> Result<()> {
        if !(volume_ul.is_finite() && volume_ul >= 0.0) {
            return Err(PumpError::Configuration(format!(
                "pump {:02}: invalid volume {volume_ul} uL",
                self.address
            )));
        }
        let unit = if unit == VolumeUnit::Ul && volume_ul > MAX_UL_FIELD {
            info!(
                "pump {:02}: {volume_ul} uL does not fit a UL field, sending in ML",
                self.address
            );
            VolumeUnit::Ml
        } else {
            unit
        };
        self.set_volume_unit(unit)?;

        let sent = format_volume(unit.from_ul(volume_ul), unit);
        self.send("VOL", &sent)?;

        let expected_ul = sent.parse::<f64>().map_or(volume_ul, |v| unit.to_ul(v));
        if let Some(reply) = self.read_back("VOL") {
            let actual = reply.value.map(|v| {
                reply
                    .unit
                    .as_deref()
                    .and_then(VolumeUnit::from_code)
                    .unwrap_or(unit)
                    .to_ul(v)
            });
            match actual {
                Some(v) if (v - expected_ul).abs() > VOLUME_TOLERANCE_UL => error!(
                    "pump {:02}: volume read back {v} uL, expected {expected_ul} uL",
                    self.address
                ),
                Some(_) => {}
                None => warn!("pump {:02}: volume read-back had no value", self.address),
            }
        }
        Ok(())
    }

    pub fn set_direction(&mut self, direction: Direction) -> Result<()> {
        self.send("DIR", direction.code())?;
        self.direction = Some(direction);

        if let Some(reply) = self.read_back("DIR") {
            match Direction::from_code(&reply.payload) {
                Some(d) if d == direction => {}
                Some(d) => error!(
                    "pump {:02}: direction read back {}, expected {}",
                    self.address,
                    d.code(),
                    direction.code()
                ),
                None => warn!(
                    "pump {:02}: direction read-back {:?} not understood",
                    self.address, reply.payload
                ),
            }
        }
        Ok(())
    }

    /// Query a parameter.  Read-back problems are logged, not raised; the
    /// write itself was already acknowledged.
    fn read_back(&mut self, command: &str) -> Option<PumpResponse> {
        match self.send(command, "") {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("pump {:02}: {command} read-back failed: {e}", self.address);
                None
            }
        }
    }

    // ── Motion ──────────────────────────────────────────────────

    pub fn start(&mut self) -> Result<()> {
        self.send("RUN", "")?;
        Ok(())
    }

    /// Stop the motor.  A stop while infusing only pauses the NE-4000, so a
    /// paused reply gets a second stop.
    pub fn stop(&mut self) -> Result<()> {
        let reply = self.send("STP", "")?;
        if reply.status == PumpStatus::Paused {
            self.send("STP", "")?;
        }
        Ok(())
    }

    /// Pause the current move; `start` resumes it.
    pub fn pause(&mut self) -> Result<()> {
        self.send("STP", "")?;
        Ok(())
    }

    pub fn purge(&mut self) -> Result<()> {
        self.send("PUR", "")?;
        Ok(())
    }

    /// Move `volume_ul` in the infuse direction.
    ///
    /// Returns the buffered duration of the move.  With `wait = true` this
    /// blocks for that long and then stops the pump.
    pub fn dispense_volume(
        &mut self,
        volume_ul: f64,
        rate_ul_min: Option<f64>,
        wait: bool,
        unit: VolumeUnit,
    ) -> Result<Duration> {
        if volume_ul.abs() < MIN_DISPENSE_UL {
            warn!(
                "pump {:02}: skipping dispense of {volume_ul} uL (zero volume would run indefinitely)",
                self.address
            );
            return Ok(Duration::ZERO);
        }

        self.set_direction(Direction::Infuse)?;
        if let Some(rate) = rate_ul_min {
            self.set_rate(rate)?;
        }
        let rate = self.rate_ul_min.ok_or_else(|| {
            PumpError::Configuration(format!(
                "pump {:02}: rate must be set before dispensing",
                self.address
            ))
        })?;

        let duration = dispense_duration(volume_ul, rate);
        self.set_volume(volume_ul, unit)?;
        self.start()?;
        info!(
            "pump {:02}: dispensing {volume_ul:.1} uL at {rate} uL/min (~{:.2}s)",
            self.address,
            duration.as_secs_f64()
        );

        if wait {
            self.clock.sleep(duration);
            self.stop()?;
        }
        Ok(duration)
    }

    /// Configure and run a withdraw or infuse of `volume_ul` to completion.
    pub fn move_volume(
        &mut self,
        direction: Direction,
        volume_ul: f64,
        rate_ul_min: f64,
        unit: VolumeUnit,
    ) -> Result<Duration> {
        if volume_ul.abs() < MIN_DISPENSE_UL {
            return Ok(Duration::ZERO);
        }
        self.set_rate(rate_ul_min)?;
        self.set_direction(direction)?;
        self.set_volume(volume_ul, unit)?;
        self.start()?;

        let duration = dispense_duration(volume_ul, rate_ul_min);
        self.clock.sleep(duration);
        self.stop()?;
        Ok(duration)
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Motor state from an empty-command query.  Unknown prompts map to
    /// [`PumpStatus::Unknown`].
    pub fn get_status(&mut self) -> Result<PumpStatus> {
        Ok(self.send("", "")?.status)
    }

    /// Programmed volume in µL, if the pump reports one.
    pub fn query_volume_ul(&mut self) -> Result<Option<f64>> {
        let reply = self.send("VOL", "")?;
        let unit = reply
            .unit
            .as_deref()
            .and_then(VolumeUnit::from_code)
            .or(self.volume_unit)
            .unwrap_or(VolumeUnit::Ml);
        Ok(reply.value.map(|v| unit.to_ul(v)))
    }

    pub fn query_dispensed(&mut self) -> Result<DispensedVolumes> {
        let reply = self.send("DIS", "")?;
        let caps = DISPENSED_RE.captures(&reply.payload).ok_or_else(|| PumpError::Command {
            address: self.address,
            command: "DIS".to_string(),
            response: reply.payload.clone(),
        })?;
        let unit = VolumeUnit::from_code(&caps[3]).unwrap_or(VolumeUnit::Ml);
        let parse = |s: &str| s.parse::<f64>().unwrap_or(0.0);
        Ok(DispensedVolumes {
            infused_ul: unit.to_ul(parse(&caps[1])),
            withdrawn_ul: unit.to_ul(parse(&caps[2])),
        })
    }

    pub fn clear_dispensed(&mut self, direction: Direction) -> Result<()> {
        self.send("CLD", direction.code())?;
        Ok(())
    }

    pub fn firmware_version(&mut self) -> Result<String> {
        Ok(self.send("VER", "")?.payload)
    }
}
