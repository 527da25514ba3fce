//! Volume ledgers and their append-only history.
//!
//! Session rows are keyed by `(session_id, ingredient)`; global rows by
//! `(protocol_id, pump_address)` because a physical syringe outlives any one
//! session.  Every state write goes through a transaction together with its
//! history row, so the ledger and the audit trail never disagree.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{OptionalExtension, Row, params};

use crate::error::Result;
use crate::volume::VolumeState;

use super::{Store, now, opt_time_column, time_column, timestamp};

/// One tracked syringe.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    pub pump_address: u8,
    pub ingredient: String,
    pub state: VolumeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEventType {
    Init,
    Dispense,
    Refill,
}

impl HistoryEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Dispense => "dispense",
            Self::Refill => "refill",
        }
    }
}

impl ToSql for HistoryEventType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for HistoryEventType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "init" => Ok(Self::Init),
            "dispense" => Ok(Self::Dispense),
            "refill" => Ok(Self::Refill),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A history row to append.  Exactly one of `session_id` / `protocol_id`
/// is set.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub session_id: Option<String>,
    pub protocol_id: Option<String>,
    pub pump_address: u8,
    pub ingredient: String,
    pub event_type: HistoryEventType,
    pub volume_change_ul: f64,
    pub volume_before_ul: f64,
    pub volume_after_ul: f64,
    pub cycle_number: Option<i64>,
    pub notes: String,
}

/// A stored history row.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeHistoryEvent {
    pub id: i64,
    pub entry: HistoryEntry,
    pub created_at: DateTime<Utc>,
}

const STATE_COLUMNS: &str = "pump_address, ingredient, current_volume_ul, max_capacity_ul, \
     alert_threshold_ul, total_dispensed_ul, last_dispensed_at, last_refilled_at";

const HISTORY_COLUMNS: &str = "id, session_id, protocol_id, pump_address, ingredient, event_type, \
     volume_change_ul, volume_before_ul, volume_after_ul, cycle_number, notes, created_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<VolumeRecord> {
    Ok(VolumeRecord {
        pump_address: row.get(0)?,
        ingredient: row.get(1)?,
        state: VolumeState {
            current_volume_ul: row.get(2)?,
            max_capacity_ul: row.get(3)?,
            alert_threshold_ul: row.get(4)?,
            total_dispensed_ul: row.get(5)?,
            last_dispensed_at: opt_time_column(row, 6)?,
            last_refilled_at: opt_time_column(row, 7)?,
        },
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<VolumeHistoryEvent> {
    Ok(VolumeHistoryEvent {
        id: row.get(0)?,
        entry: HistoryEntry {
            session_id: row.get(1)?,
            protocol_id: row.get(2)?,
            pump_address: row.get(3)?,
            ingredient: row.get(4)?,
            event_type: row.get(5)?,
            volume_change_ul: row.get(6)?,
            volume_before_ul: row.get(7)?,
            volume_after_ul: row.get(8)?,
            cycle_number: row.get(9)?,
            notes: row.get(10)?,
        },
        created_at: time_column(row, 11)?,
    })
}

fn insert_history(conn: &rusqlite::Connection, entry: &HistoryEntry) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO volume_history
             (session_id, protocol_id, pump_address, ingredient, event_type, volume_change_ul,
              volume_before_ul, volume_after_ul, cycle_number, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.session_id,
            entry.protocol_id,
            entry.pump_address,
            entry.ingredient,
            entry.event_type,
            entry.volume_change_ul,
            entry.volume_before_ul,
            entry.volume_after_ul,
            entry.cycle_number,
            entry.notes,
            now()
        ],
    )
}

fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(timestamp)
}

impl Store {
    // ── Session ledger ──────────────────────────────────────────

    pub fn session_volume(&self, session_id: &str, ingredient: &str) -> Result<Option<VolumeRecord>> {
        let conn = self.conn();
        let rec = conn
            .query_row(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM session_volume_state
                     WHERE session_id = ?1 AND ingredient = ?2"
                ),
                params![session_id, ingredient],
                record_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    /// Snapshot of every tracked ingredient in a session.
    pub fn volume_status(&self, session_id: &str) -> Result<Vec<VolumeRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM session_volume_state
             WHERE session_id = ?1 ORDER BY pump_address"
        ))?;
        let rows = stmt.query_map(params![session_id], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Write a session ledger row and its history entry atomically.
    pub fn save_session_volume(
        &self,
        session_id: &str,
        record: &VolumeRecord,
        history: &HistoryEntry,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let s = &record.state;
        tx.execute(
            "INSERT INTO session_volume_state
                 (session_id, ingredient, pump_address, current_volume_ul, max_capacity_ul,
                  alert_threshold_ul, total_dispensed_ul, last_dispensed_at, last_refilled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (session_id, ingredient) DO UPDATE SET
                 pump_address = excluded.pump_address,
                 current_volume_ul = excluded.current_volume_ul,
                 max_capacity_ul = excluded.max_capacity_ul,
                 alert_threshold_ul = excluded.alert_threshold_ul,
                 total_dispensed_ul = excluded.total_dispensed_ul,
                 last_dispensed_at = excluded.last_dispensed_at,
                 last_refilled_at = excluded.last_refilled_at",
            params![
                session_id,
                record.ingredient,
                record.pump_address,
                s.current_volume_ul,
                s.max_capacity_ul,
                s.alert_threshold_ul,
                s.total_dispensed_ul,
                opt_ts(s.last_dispensed_at),
                opt_ts(s.last_refilled_at)
            ],
        )?;
        insert_history(&tx, history)?;
        tx.commit()?;
        Ok(())
    }

    // ── Global ledger ───────────────────────────────────────────

    pub fn global_volume(&self, protocol_id: &str, pump_address: u8) -> Result<Option<VolumeRecord>> {
        let conn = self.conn();
        let rec = conn
            .query_row(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM global_volume_state
                     WHERE protocol_id = ?1 AND pump_address = ?2"
                ),
                params![protocol_id, pump_address],
                record_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn global_volume_status(&self, protocol_id: &str) -> Result<Vec<VolumeRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM global_volume_state
             WHERE protocol_id = ?1 ORDER BY pump_address"
        ))?;
        let rows = stmt.query_map(params![protocol_id], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn save_global_volume(
        &self,
        protocol_id: &str,
        record: &VolumeRecord,
        history: &HistoryEntry,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let s = &record.state;
        tx.execute(
            "INSERT INTO global_volume_state
                 (protocol_id, pump_address, ingredient, current_volume_ul, max_capacity_ul,
                  alert_threshold_ul, total_dispensed_ul, last_dispensed_at, last_refilled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (protocol_id, pump_address) DO UPDATE SET
                 ingredient = excluded.ingredient,
                 current_volume_ul = excluded.current_volume_ul,
                 max_capacity_ul = excluded.max_capacity_ul,
                 alert_threshold_ul = excluded.alert_threshold_ul,
                 total_dispensed_ul = excluded.total_dispensed_ul,
                 last_dispensed_at = excluded.last_dispensed_at,
                 last_refilled_at = excluded.last_refilled_at",
            params![
                protocol_id,
                record.pump_address,
                record.ingredient,
                s.current_volume_ul,
                s.max_capacity_ul,
                s.alert_threshold_ul,
                s.total_dispensed_ul,
                opt_ts(s.last_dispensed_at),
                opt_ts(s.last_refilled_at)
            ],
        )?;
        insert_history(&tx, history)?;
        tx.commit()?;
        Ok(())
    }

    // ── History ─────────────────────────────────────────────────

    /// Most recent first.
    pub fn session_volume_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<VolumeHistoryEvent>> {
        self.history_where("session_id", session_id, limit)
    }

    pub fn global_volume_history(
        &self,
        protocol_id: &str,
        limit: usize,
    ) -> Result<Vec<VolumeHistoryEvent>> {
        self.history_where("protocol_id", protocol_id, limit)
    }

    fn history_where(&self, column: &str, key: &str, limit: usize) -> Result<Vec<VolumeHistoryEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM volume_history
             WHERE {column} = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![key, limit], history_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete history rows created before `cutoff`.  The only deletion the
    /// history table ever sees.
    pub fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM volume_history WHERE created_at < ?1",
            params![timestamp(cutoff)],
        )?;
        Ok(deleted)
    }
}
