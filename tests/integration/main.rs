//! Integration test driver for `tests/integration/` submodules.
//!
//! Each `mod` below exercises one slice of the service against the pump
//! emulator, an in-memory SQLite store and a clock that records sleeps
//! instead of blocking.  No serial hardware is required.

mod dispense_tests;
mod lifecycle_tests;
mod mock;
mod refill_tests;
mod volume_tests;
