//! RS-232 adapter for the pump chain.
//!
//! [`SerialTransport`] implements the byte-level [`Transport`] over a
//! `serialport` handle (8N1, no flow control, per-read timeout).
//! [`SerialConnector`] implements [`PortConnector`] and keeps one open
//! handle per device path so every pump on a chain shares it.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::app::ports::PortConnector;
use crate::codec::ETX;
use crate::error::{PumpError, Result};
use crate::transport::{SerialSettings, SharedTransport, Transport, share};

/// Burst replies are collected until the line has been quiet this long.
const DRAIN_QUIET: Duration = Duration::from_millis(100);

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
    timeout: Duration,
}

impl SerialTransport {
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        let timeout = Duration::from_millis(settings.timeout_ms);
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| {
                PumpError::Connection(format!("failed to open {}: {e}", settings.port))
            })?;
        info!("serial: opened {} @ {} baud", settings.port, settings.baud_rate);
        Ok(Self {
            port,
            name: settings.port.clone(),
            timeout,
        })
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn read_reply(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);
        loop {
            let Some(byte) = self.read_byte()? else {
                if buf.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reply on {} within {:?}", self.name, self.timeout),
                    ));
                }
                debug!("serial: partial reply on {}: {buf:?}", self.name);
                return Ok(buf);
            };
            // leading line ends belong to the previous reply
            if buf.is_empty() && matches!(byte, b'\r' | b'\n') {
                continue;
            }
            buf.push(byte);
            if matches!(byte, ETX | b'\r' | b'\n') {
                return Ok(buf);
            }
        }
    }

    fn drain(&mut self) -> io::Result<Vec<u8>> {
        self.port.set_timeout(DRAIN_QUIET).map_err(io::Error::from)?;
        let mut buf = Vec::new();
        let result = loop {
            match self.read_byte() {
                Ok(Some(b)) => buf.push(b),
                Ok(None) => break Ok(buf),
                Err(e) => break Err(e),
            }
        };
        self.port.set_timeout(self.timeout).map_err(io::Error::from)?;
        result
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens real serial ports, one shared handle per path.
#[derive(Default)]
pub struct SerialConnector {
    open_ports: Mutex<HashMap<String, (u32, SharedTransport)>>,
}

impl SerialConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PortConnector for SerialConnector {
    fn open(&self, settings: &SerialSettings) -> Result<SharedTransport> {
        let mut ports = self.open_ports.lock();
        if let Some((baud, bus)) = ports.get(&settings.port) {
            if *baud != settings.baud_rate {
                warn!(
                    "serial: {} already open at {baud} baud, ignoring request for {}",
                    settings.port, settings.baud_rate
                );
            }
            return Ok(bus.clone());
        }
        let bus = share(SerialTransport::open(settings)?);
        ports.insert(settings.port.clone(), (settings.baud_rate, bus.clone()));
        Ok(bus)
    }

    fn release(&self, port: &str) {
        if self.open_ports.lock().remove(port).is_some() {
            debug!("serial: released {port}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_a_connection_error() {
        let connector = SerialConnector::new();
        let settings = SerialSettings::new("/dev/does-not-exist-pump", 19_200, 50);
        assert!(matches!(
            connector.open(&settings),
            Err(PumpError::Connection(_))
        ));
        // nothing cached after a failed open
        assert!(connector.open_ports.lock().is_empty());
    }
}
