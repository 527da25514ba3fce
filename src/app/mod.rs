//! Application core: the dispensing domain.
//!
//! Operation handling for the pump service: claiming queued dispenses and
//! refills, planning recipes onto pumps, choosing a bus strategy, and
//! feeding volume tracking.  All interaction with the bus, the clock and
//! the operator goes through the **port traits** in [`ports`], keeping this
//! layer testable against the emulator.

pub mod dispense;
pub mod events;
pub mod ports;
pub mod refill;
pub mod service;
