//! In-process NE-4000 chain emulator.
//!
//! Answers addressed commands and network bursts the way a chain of pumps
//! would, so the whole service runs without hardware (`--simulate`) and the
//! integration tests can drive the real driver/orchestrator code paths.
//!
//! Every address answers unless marked offline.  Out-of-range values are
//! refused with `?OOR`, unknown commands with `S?`, and accumulated
//! infused/withdrawn volume is tracked per pump for `DIS`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::app::ports::PortConnector;
use crate::codec::{
    Direction, ETX, PumpStatus, RateUnit, STX, VolumeUnit, format_diameter, format_rate,
    format_volume, max_rate_for_diameter,
};
use crate::error::Result;
use crate::transport::{SerialSettings, SharedTransport, Transport};

const FIRMWARE: &str = "NE4000V3.934";

/// Observable state of one emulated pump.
#[derive(Debug, Clone, PartialEq)]
pub struct SimPump {
    pub diameter_mm: f64,
    pub rate_ul_min: f64,
    pub volume: f64,
    pub volume_unit: VolumeUnit,
    pub direction: Direction,
    pub status: PumpStatus,
    pub infused_ul: f64,
    pub withdrawn_ul: f64,
    pub runs: u32,
}

impl Default for SimPump {
    fn default() -> Self {
        Self {
            diameter_mm: 26.59,
            rate_ul_min: 0.0,
            volume: 0.0,
            volume_unit: VolumeUnit::Ml,
            direction: Direction::Infuse,
            status: PumpStatus::Stopped,
            infused_ul: 0.0,
            withdrawn_ul: 0.0,
            runs: 0,
        }
    }
}

impl SimPump {
    fn prompt(&self) -> char {
        match self.status {
            PumpStatus::Infusing => 'I',
            PumpStatus::Withdrawing => 'W',
            PumpStatus::Paused => 'P',
            PumpStatus::TimedPause => 'T',
            PumpStatus::UserWait => 'U',
            PumpStatus::Purging => 'X',
            PumpStatus::Alarm => 'A',
            PumpStatus::Stopped | PumpStatus::Unknown => 'S',
        }
    }
}

/// Outcome of one command against one pump.
enum Reply {
    Ok(String),
    OutOfRange,
    Unknown,
}

/// Shared emulator state.  Tests keep a clone of the handle to inspect
/// pumps and inject faults.
#[derive(Debug, Default)]
pub struct SimState {
    pumps: BTreeMap<u8, SimPump>,
    offline: BTreeSet<u8>,
    /// Addresses that refuse `RUN` with `?OOR`.
    reject_run: BTreeSet<u8>,
    pending: VecDeque<Vec<u8>>,
    lines: Vec<String>,
}

pub type SimHandle = Arc<Mutex<SimState>>;

impl SimState {
    pub fn pump(&self, address: u8) -> Option<&SimPump> {
        self.pumps.get(&address)
    }

    /// Every line written to the bus, CR stripped.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn set_offline(&mut self, address: u8, offline: bool) {
        if offline {
            self.offline.insert(address);
        } else {
            self.offline.remove(&address);
        }
    }

    pub fn reject_run(&mut self, address: u8, reject: bool) {
        if reject {
            self.reject_run.insert(address);
        } else {
            self.reject_run.remove(&address);
        }
    }

    fn execute(&mut self, address: u8, command: &str, args: &str) -> Reply {
        let fail_run = self.reject_run.contains(&address);
        let pump = self.pumps.entry(address).or_default();
        match (command, args) {
            ("", _) => Reply::Ok(String::new()),
            ("DIA", "") => Reply::Ok(format_diameter(pump.diameter_mm)),
            ("DIA", v) => match v.parse::<f64>() {
                Ok(d) if (0.1..=50.0).contains(&d) => {
                    pump.diameter_mm = d;
                    Reply::Ok(String::new())
                }
                _ => Reply::OutOfRange,
            },
            ("RAT", "") => {
                let (v, unit) = format_rate(pump.rate_ul_min, RateUnit::UlPerMin);
                Reply::Ok(format!("{v}{}", unit.code()))
            }
            ("RAT", v) => {
                let mut parts = v.split_whitespace();
                let value = parts.next().and_then(|s| s.parse::<f64>().ok());
                let unit = parts.next().map_or(Some(RateUnit::UlPerMin), RateUnit::from_code);
                match (value, unit) {
                    (Some(value), Some(unit)) => {
                        let rate = unit.to_ul_per_min(value);
                        if rate <= 0.0 || rate > max_rate_for_diameter(pump.diameter_mm) {
                            Reply::OutOfRange
                        } else {
                            pump.rate_ul_min = rate;
                            Reply::Ok(String::new())
                        }
                    }
                    _ => Reply::Unknown,
                }
            }
            ("VOL", "") => Reply::Ok(format!(
                "{}{}",
                format_volume(pump.volume, pump.volume_unit),
                pump.volume_unit.code()
            )),
            ("VOL", v) => {
                if let Some(unit) = VolumeUnit::from_code(v) {
                    pump.volume_unit = unit;
                    Reply::Ok(String::new())
                } else {
                    match v.parse::<f64>() {
                        Ok(x) if x >= 0.0 && x <= 9999.0 => {
                            pump.volume = x;
                            Reply::Ok(String::new())
                        }
                        Ok(_) => Reply::OutOfRange,
                        Err(_) => Reply::Unknown,
                    }
                }
            }
            ("DIR", "") => Reply::Ok(pump.direction.code().to_string()),
            ("DIR", v) => match Direction::from_code(v) {
                Some(Direction::Reverse) => {
                    pump.direction = match pump.direction {
                        Direction::Infuse => Direction::Withdraw,
                        _ => Direction::Infuse,
                    };
                    Reply::Ok(String::new())
                }
                Some(d) => {
                    pump.direction = d;
                    Reply::Ok(String::new())
                }
                None => Reply::Unknown,
            },
            ("RUN", _) => {
                if fail_run || pump.rate_ul_min <= 0.0 {
                    return Reply::OutOfRange;
                }
                let moved = pump.volume_unit.to_ul(pump.volume);
                match pump.direction {
                    Direction::Withdraw => {
                        pump.status = PumpStatus::Withdrawing;
                        pump.withdrawn_ul += moved;
                    }
                    _ => {
                        pump.status = PumpStatus::Infusing;
                        pump.infused_ul += moved;
                    }
                }
                pump.runs += 1;
                Reply::Ok(String::new())
            }
            ("STP", _) => {
                pump.status = if pump.status.is_moving() {
                    PumpStatus::Paused
                } else {
                    PumpStatus::Stopped
                };
                Reply::Ok(String::new())
            }
            ("PUR", _) => {
                pump.status = PumpStatus::Purging;
                Reply::Ok(String::new())
            }
            ("DIS", _) => Reply::Ok(format!(
                "I{:.3}W{:.3}ML",
                pump.infused_ul / 1000.0,
                pump.withdrawn_ul / 1000.0
            )),
            ("CLD", "INF") => {
                pump.infused_ul = 0.0;
                Reply::Ok(String::new())
            }
            ("CLD", "WDR") => {
                pump.withdrawn_ul = 0.0;
                Reply::Ok(String::new())
            }
            ("VER", _) => Reply::Ok(FIRMWARE.to_string()),
            _ => Reply::Unknown,
        }
    }

    fn frame(&self, address: u8, reply: &Reply) -> String {
        let prompt = self.pumps.get(&address).map_or('S', SimPump::prompt);
        match reply {
            Reply::Ok(payload) => format!("{address:02}{prompt}{payload}"),
            Reply::OutOfRange => format!("{address:02}{prompt}?OOR"),
            Reply::Unknown => format!("{address:02}{prompt}?"),
        }
    }

    fn handle_single(&mut self, line: &str) {
        let (address, rest) = match line.as_bytes() {
            [a, b, ..] if a.is_ascii_digit() && b.is_ascii_digit() => {
                ((a - b'0') * 10 + (b - b'0'), &line[2..])
            }
            _ => (0, line),
        };
        if self.offline.contains(&address) {
            return;
        }
        let split = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let (command, args) = rest.split_at(split);
        let reply = self.execute(address, &command.to_ascii_uppercase(), args.trim());
        let text = self.frame(address, &reply);
        let mut framed = Vec::with_capacity(text.len() + 2);
        framed.push(STX);
        framed.extend_from_slice(text.as_bytes());
        framed.push(ETX);
        self.pending.push_back(framed);
    }

    /// Apply every `<addr> <CMD> [<args>]` segment.  The combined reply is
    /// noise except for out-of-range markers.
    fn handle_burst(&mut self, line: &str) {
        let mut noise = String::new();
        for segment in line.split('*').map(str::trim).filter(|s| !s.is_empty()) {
            let mut parts = segment.splitn(3, ' ');
            let address = parts.next().and_then(|a| a.parse::<u8>().ok());
            let command = parts.next().unwrap_or_default().to_ascii_uppercase();
            let args = parts.next().unwrap_or_default().trim();
            let Some(address) = address else {
                continue;
            };
            if self.offline.contains(&address) {
                continue;
            }
            let reply = self.execute(address, &command, args);
            noise.push_str(&self.frame(address, &reply));
        }
        self.pending.push_back(noise.into_bytes());
    }

    fn handle_write(&mut self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        for line in text.split(['\r', '\n']).filter(|l| !l.trim().is_empty()) {
            self.lines.push(line.to_string());
            debug!("sim <- {line:?}");
            if line.contains('*') {
                self.handle_burst(line);
            } else {
                self.handle_single(line.trim());
            }
        }
    }
}

/// A [`Transport`] backed by the emulator.
pub struct SimulatedBus {
    state: SimHandle,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::with_handle(Arc::new(Mutex::new(SimState::default())))
    }

    pub fn with_handle(state: SimHandle) -> Self {
        Self { state }
    }

    pub fn handle(&self) -> SimHandle {
        self.state.clone()
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedBus {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.state.lock().handle_write(data);
        Ok(())
    }

    fn read_reply(&mut self) -> io::Result<Vec<u8>> {
        self.state
            .lock()
            .pending
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no reply"))
    }

    fn drain(&mut self) -> io::Result<Vec<u8>> {
        let mut state = self.state.lock();
        Ok(state.pending.drain(..).flatten().collect())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().pending.clear();
        Ok(())
    }
}

/// Hands out one emulated chain per port path.
#[derive(Default)]
pub struct SimConnector {
    buses: Mutex<HashMap<String, (SimHandle, SharedTransport)>>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulator state behind `port`, created on first use.
    pub fn handle(&self, port: &str) -> SimHandle {
        self.bus_for(port).0
    }

    fn bus_for(&self, port: &str) -> (SimHandle, SharedTransport) {
        let mut buses = self.buses.lock();
        let entry = buses.entry(port.to_string()).or_insert_with(|| {
            let bus = SimulatedBus::new();
            let handle = bus.handle();
            let shared: SharedTransport = Arc::new(Mutex::new(bus));
            (handle, shared)
        });
        (entry.0.clone(), entry.1.clone())
    }
}

impl PortConnector for SimConnector {
    fn open(&self, settings: &SerialSettings) -> Result<SharedTransport> {
        Ok(self.bus_for(&settings.port).1)
    }

    // The emulated chain keeps its state across reconnects.
    fn release(&self, _port: &str) {}
}
