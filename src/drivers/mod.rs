//! Pump drivers: single-address command/verify and multi-pump bursts.

pub mod burst;
pub mod pump;

pub use burst::{BurstCommandBuilder, BurstPumpConfig, validate_burst};
pub use pump::{DriverState, PumpDriver, dispense_duration};
