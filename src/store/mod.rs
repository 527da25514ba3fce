//! Durable state shared with the web application (SQLite).
//!
//! The database is the only channel between the producer (web app, which
//! enqueues operations) and this service (which claims and executes them).
//! Job state lives in the status column; there is no other IPC.
//!
//! | File            | Tables                                              |
//! |-----------------|-----------------------------------------------------|
//! | `operations`    | `pump_operations`, `pump_refill_operations`         |
//! | `volumes`       | `session_volume_state`, `global_volume_state`,      |
//! |                 | `volume_history`                                    |
//! | `protocols`     | `protocols`, `sessions`                             |

pub mod operations;
pub mod protocols;
pub mod volumes;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Row};
use serde::de::DeserializeOwned;

use crate::error::{PumpError, Result};

pub use operations::{DispenseOperation, OperationStatus, RefillOperation, RefillType};
pub use volumes::{HistoryEntry, HistoryEventType, VolumeHistoryEvent, VolumeRecord};

/// Writers from the web app hold the lock briefly; wait rather than fail.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS protocols (
    protocol_id  TEXT PRIMARY KEY,
    name         TEXT NOT NULL DEFAULT '',
    pump_config  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id   TEXT PRIMARY KEY,
    protocol_id  TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pump_operations (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id           TEXT NOT NULL,
    cycle_number         INTEGER NOT NULL,
    trial_number         INTEGER,
    recipe_json          TEXT NOT NULL,
    status               TEXT NOT NULL DEFAULT 'pending'
                         CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
    created_at           TEXT NOT NULL,
    started_at           TEXT,
    completed_at         TEXT,
    actual_volumes_json  TEXT,
    error_message        TEXT
);
CREATE INDEX IF NOT EXISTS idx_pump_operations_queue
    ON pump_operations (status, created_at, id);

CREATE TABLE IF NOT EXISTS pump_refill_operations (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    protocol_id      TEXT NOT NULL,
    pump_address     INTEGER NOT NULL,
    operation_type   TEXT NOT NULL CHECK (operation_type IN ('withdraw', 'purge')),
    volume_ul        REAL NOT NULL,
    direction        TEXT NOT NULL CHECK (direction IN ('INF', 'WDR')),
    ingredient_name  TEXT,
    status           TEXT NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    completed_at     TEXT,
    error_message    TEXT
);
CREATE INDEX IF NOT EXISTS idx_pump_refill_operations_queue
    ON pump_refill_operations (status, created_at, id);

CREATE TABLE IF NOT EXISTS session_volume_state (
    session_id          TEXT NOT NULL,
    ingredient          TEXT NOT NULL,
    pump_address        INTEGER NOT NULL,
    current_volume_ul   REAL NOT NULL,
    max_capacity_ul     REAL NOT NULL,
    alert_threshold_ul  REAL NOT NULL,
    total_dispensed_ul  REAL NOT NULL DEFAULT 0,
    last_dispensed_at   TEXT,
    last_refilled_at    TEXT,
    PRIMARY KEY (session_id, ingredient)
);

CREATE TABLE IF NOT EXISTS global_volume_state (
    protocol_id         TEXT NOT NULL,
    pump_address        INTEGER NOT NULL,
    ingredient          TEXT NOT NULL,
    current_volume_ul   REAL NOT NULL,
    max_capacity_ul     REAL NOT NULL,
    alert_threshold_ul  REAL NOT NULL,
    total_dispensed_ul  REAL NOT NULL DEFAULT 0,
    last_dispensed_at   TEXT,
    last_refilled_at    TEXT,
    PRIMARY KEY (protocol_id, pump_address)
);

CREATE TABLE IF NOT EXISTS volume_history (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id        TEXT,
    protocol_id       TEXT,
    pump_address      INTEGER NOT NULL,
    ingredient        TEXT NOT NULL,
    event_type        TEXT NOT NULL CHECK (event_type IN ('init', 'dispense', 'refill')),
    volume_change_ul  REAL NOT NULL,
    volume_before_ul  REAL NOT NULL,
    volume_after_ul   REAL NOT NULL,
    cycle_number      INTEGER,
    notes             TEXT NOT NULL DEFAULT '',
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_volume_history_created ON volume_history (created_at);
";

/// Handle on the shared database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open an existing database.  The service never creates the file; the
    /// web application owns it.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PumpError::Configuration(format!(
                "database {} does not exist",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("store: journal_mode={mode}");
        let store = Self::init(conn)?;
        info!("store: opened {}", path.display());
        Ok(store)
    }

    /// Fresh private database, used by tests and the simulator.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        debug!("store: schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// RFC 3339 with millisecond precision; sorts lexically in time order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now() -> String {
    timestamp(Utc::now())
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_time_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_refuses_missing_file() {
        let err = Store::open(Path::new("/nonexistent/robotaste.db"))
            .err()
            .expect("missing file must fail");
        assert!(matches!(err, PumpError::Configuration(_)));
    }

    #[test]
    fn schema_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.conn().execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn timestamps_sort_in_time_order() {
        let a = timestamp(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let b = timestamp(DateTime::from_timestamp(1_700_000_000, 5_000_000).unwrap());
        assert!(a < b);
        assert!(a.ends_with('Z'));
    }
}
