//! Unified error types for the pump control service.
//!
//! A single `PumpError` enum that every subsystem converts into, keeping the
//! orchestrator's error handling uniform.  The first four variants are the
//! device-facing taxonomy; the rest cover the durable store and tracking.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Error)]
pub enum PumpError {
    /// Serial port unreachable, bus busy, or the pump handle is not connected.
    #[error("connection error: {0}")]
    Connection(String),

    /// The pump rejected a command (out-of-range value, malformed command).
    #[error("pump {address:02} rejected '{command}': {response}")]
    Command {
        address: u8,
        command: String,
        response: String,
    },

    /// No usable response arrived before the read deadline.
    #[error("pump {address:02} timed out waiting for response to '{command}'")]
    Timeout { address: u8, command: String },

    /// Missing ingredient mapping, invalid unit, missing diameter, etc.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every violation found while validating a burst configuration.
    #[error("burst validation failed: {}", .0.join("; "))]
    BurstValidation(Vec<String>),

    /// A volume-tracking update was rejected.
    #[error("volume tracking: {0}")]
    Volume(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PumpError {
    /// Timeouts and device rejections are worth another attempt; I/O and
    /// configuration failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Command { .. })
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, PumpError>;
