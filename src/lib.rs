//! RoboTaste pump control library.
//!
//! Drives chains of New Era NE-4000 syringe pumps over RS-232 on behalf of
//! a web application that queues dispense and refill operations in a
//! shared SQLite database.  Exposed as a library for the service binary
//! and the integration tests.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod codec;
pub mod config;
pub mod drivers;
pub mod error;
pub mod pool;
pub mod store;
pub mod transport;
pub mod volume;

pub use error::{PumpError, Result};
