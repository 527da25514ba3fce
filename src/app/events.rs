//! Outbound application events.
//!
//! The [`DispenseService`](super::service::DispenseService) emits these
//! through the [`EventSink`](super::ports::EventSink) port.  The default
//! adapter logs them; the web application reads results from the database,
//! not from here.

use std::fmt;
use std::time::Duration;

/// Which queue an operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Dispense,
    Refill,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dispense => "dispense",
            Self::Refill => "refill",
        })
    }
}

/// How a dispense was driven on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Burst,
    Simultaneous,
    Sequential,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Burst => "burst",
            Self::Simultaneous => "simultaneous",
            Self::Sequential => "sequential",
        })
    }
}

/// Session-scoped or protocol-wide volume accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeScope {
    Session(String),
    Protocol(String),
}

impl fmt::Display for VolumeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session {id}"),
            Self::Protocol(id) => write!(f, "protocol {id}"),
        }
    }
}

/// Structured events emitted by the application core.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// The service loop is about to start polling.
    Started { db_path: String, simulate: bool },

    /// Operations left `in_progress` by a previous run.  They are reported,
    /// never reclaimed.
    StaleOperation { kind: OperationKind, operation_id: i64 },

    /// An operation was atomically claimed from its queue.
    Claimed { kind: OperationKind, operation_id: i64 },

    DispenseCompleted {
        operation_id: i64,
        session_id: String,
        cycle_number: i64,
        strategy: Strategy,
        elapsed: Duration,
    },

    DispenseFailed { operation_id: i64, error: String },

    RefillCompleted {
        operation_id: i64,
        pump_address: u8,
        withdraw: bool,
        volume_ul: f64,
    },

    RefillFailed { operation_id: i64, error: String },

    /// Tracked volume dropped to or below the pump's alert threshold.
    VolumeLow {
        scope: VolumeScope,
        pump_address: u8,
        ingredient: String,
        remaining_ul: f64,
        threshold_ul: f64,
    },

    /// A dispense asked for more than the syringe held.
    RanEmpty {
        scope: VolumeScope,
        pump_address: u8,
        ingredient: String,
    },

    /// Volume history rows older than the retention window were deleted.
    HistoryPruned { rows: usize },

    /// Shutdown requested; pumps stopped and ports closed.
    Stopped,
}
