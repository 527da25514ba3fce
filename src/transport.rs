//! Transport abstraction: the byte-oriented serial bus.
//!
//! Concrete implementations:
//! - RS-232 serial port ([`crate::adapters::serial::SerialTransport`])
//! - in-process NE-4000 emulator ([`crate::adapters::sim::SimulatedBus`])
//!
//! Every pump on a daisy chain shares one physical line, so drivers hold a
//! [`SharedTransport`] and lock it for the duration of one write/read
//! exchange.  That lock is also what serialises command execution per
//! device.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

/// Byte-oriented half-duplex channel to the pump chain.
pub trait Transport: Send {
    /// Write the whole buffer and flush it.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read one reply: everything up to and including ETX, CR or LF.
    ///
    /// Returns `ErrorKind::TimedOut` if nothing arrived before the read
    /// deadline.  A partial reply is returned as-is when the deadline hits
    /// mid-frame.
    fn read_reply(&mut self) -> io::Result<Vec<u8>>;

    /// Read everything that arrives until the line goes quiet.  Used for
    /// burst replies, which carry no reliable framing.
    fn drain(&mut self) -> io::Result<Vec<u8>>;

    /// Discard any unread input (stale replies from a previous exchange).
    fn clear_input(&mut self) -> io::Result<()>;
}

/// A bus handle shared by every driver on the same port.
pub type SharedTransport = Arc<Mutex<dyn Transport>>;

/// Wrap a concrete transport into a shareable bus handle.
pub fn share<T: Transport + 'static>(transport: T) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// Serial line settings for one pump chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Per-reply read deadline.
    pub timeout_ms: u64,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout_ms: u64) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout_ms,
        }
    }
}

/// A transport that accepts all writes and never answers.
/// Useful in tests that exercise timeout handling.
pub struct NullTransport;

impl Transport for NullTransport {
    fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn read_reply(&mut self) -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"))
    }

    fn drain(&mut self) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}
