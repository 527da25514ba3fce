//! Port traits: the boundary between the dispensing domain and the outside
//! world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ DispenseService (domain)
//! ```
//!
//! Driven adapters (serial ports, the pump emulator, clocks, event sinks)
//! implement these traits.  Drivers and the orchestrator only ever see the
//! traits, so the whole stack runs against the emulator and a recording
//! clock in tests.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::transport::{SerialSettings, SharedTransport};

// ───────────────────────────────────────────────────────────────
// Port connector (driven adapter: domain → serial bus)
// ───────────────────────────────────────────────────────────────

/// Opens pump buses.
///
/// Several drivers may ask for the same port; implementations must hand back
/// the same underlying bus so that all pumps on a daisy chain serialise on
/// one lock.
pub trait PortConnector: Send + Sync {
    /// Open (or reuse) the bus behind `settings.port`.
    fn open(&self, settings: &SerialSettings) -> Result<SharedTransport>;

    /// Drop the connector's handle on `port`.  The OS port closes once the
    /// last driver holding it disconnects.
    fn release(&self, port: &str);
}

// ───────────────────────────────────────────────────────────────
// Time port (driven adapter: domain → wall clock)
// ───────────────────────────────────────────────────────────────

/// Sleeping and timestamps.  Dispense timing is sleep-based, so tests swap
/// in a clock that records sleeps instead of blocking.
pub trait TimePort: Send + Sync {
    fn sleep(&self, duration: Duration);

    fn now(&self) -> DateTime<Utc>;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`AppEvent`](super::events::AppEvent)s
/// through this port.  Adapters decide where they go.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::AppEvent);
}
