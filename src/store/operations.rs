//! Dispense and refill queues.
//!
//! Lifecycle of every row:
//!
//! ```text
//! pending ──claim──▶ in_progress ──▶ completed
//!                                └─▶ failed
//! ```
//!
//! Claiming selects the oldest pending row and flips it to `in_progress`
//! inside one `IMMEDIATE` transaction, before any pump I/O happens.  A crash
//! mid-dispense therefore leaves the row `in_progress` for manual recovery
//! instead of making it claimable again.  Terminal updates only apply to
//! `in_progress` rows, so no row skips a state or re-enters `pending`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use crate::codec::Direction;
use crate::error::{PumpError, Result};

use super::{Store, json_column, now, opt_json_column, opt_time_column, time_column};

/// Ingredient name → volume (µL).
pub type Recipe = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for OperationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OperationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// What a refill does to the syringe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillType {
    /// Draw liquid into the syringe.
    Withdraw,
    /// Push liquid out (priming lines, emptying).
    Purge,
}

impl RefillType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Withdraw => "withdraw",
            Self::Purge => "purge",
        }
    }

    pub const fn default_direction(self) -> Direction {
        match self {
            Self::Withdraw => Direction::Withdraw,
            Self::Purge => Direction::Infuse,
        }
    }
}

impl ToSql for RefillType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RefillType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "withdraw" => Ok(Self::Withdraw),
            "purge" => Ok(Self::Purge),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispenseOperation {
    pub id: i64,
    pub session_id: String,
    pub cycle_number: i64,
    pub trial_number: Option<i64>,
    pub recipe: Recipe,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actual_volumes: Option<Recipe>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefillOperation {
    pub id: i64,
    pub protocol_id: String,
    pub pump_address: u8,
    pub operation_type: RefillType,
    pub volume_ul: f64,
    pub direction: Direction,
    pub ingredient_name: Option<String>,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

const DISPENSE_COLUMNS: &str = "id, session_id, cycle_number, trial_number, recipe_json, status, \
     created_at, started_at, completed_at, actual_volumes_json, error_message";

const REFILL_COLUMNS: &str = "id, protocol_id, pump_address, operation_type, volume_ul, direction, \
     ingredient_name, status, created_at, started_at, completed_at, error_message";

fn dispense_from_row(row: &Row<'_>) -> rusqlite::Result<DispenseOperation> {
    Ok(DispenseOperation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        cycle_number: row.get(2)?,
        trial_number: row.get(3)?,
        recipe: json_column(row, 4)?,
        status: row.get(5)?,
        created_at: time_column(row, 6)?,
        started_at: opt_time_column(row, 7)?,
        completed_at: opt_time_column(row, 8)?,
        actual_volumes: opt_json_column(row, 9)?,
        error_message: row.get(10)?,
    })
}

fn refill_from_row(row: &Row<'_>) -> rusqlite::Result<RefillOperation> {
    let direction: String = row.get(5)?;
    Ok(RefillOperation {
        id: row.get(0)?,
        protocol_id: row.get(1)?,
        pump_address: row.get(2)?,
        operation_type: row.get(3)?,
        volume_ul: row.get(4)?,
        direction: Direction::from_code(&direction).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown direction {direction:?}").into(),
            )
        })?,
        ingredient_name: row.get(6)?,
        status: row.get(7)?,
        created_at: time_column(row, 8)?,
        started_at: opt_time_column(row, 9)?,
        completed_at: opt_time_column(row, 10)?,
        error_message: row.get(11)?,
    })
}

/// The two queue tables share their lifecycle columns.
#[derive(Clone, Copy)]
enum Queue {
    Dispense,
    Refill,
}

impl Queue {
    const fn table(self) -> &'static str {
        match self {
            Self::Dispense => "pump_operations",
            Self::Refill => "pump_refill_operations",
        }
    }
}

impl Store {
    // ── Dispense queue ──────────────────────────────────────────

    /// Called by the web application once per experiment cycle.
    pub fn enqueue_dispense(
        &self,
        session_id: &str,
        cycle_number: i64,
        trial_number: Option<i64>,
        recipe: &Recipe,
    ) -> Result<i64> {
        if recipe.is_empty() {
            return Err(PumpError::configuration("recipe is empty"));
        }
        let recipe_json = serde_json::to_string(recipe)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pump_operations
                 (session_id, cycle_number, trial_number, recipe_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![session_id, cycle_number, trial_number, recipe_json, now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_dispense_operation(&self, id: i64) -> Result<Option<DispenseOperation>> {
        let conn = self.conn();
        let op = conn
            .query_row(
                &format!("SELECT {DISPENSE_COLUMNS} FROM pump_operations WHERE id = ?1"),
                params![id],
                dispense_from_row,
            )
            .optional()?;
        Ok(op)
    }

    /// Oldest pending operations first.
    pub fn get_pending_operations(&self, limit: usize) -> Result<Vec<DispenseOperation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DISPENSE_COLUMNS} FROM pump_operations
             WHERE status = 'pending'
             ORDER BY created_at ASC, id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit_param(limit)], dispense_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Atomically move the oldest pending dispense to `in_progress`.
    ///
    /// A claimed row that cannot be decoded is marked failed before the
    /// error is returned.
    pub fn claim_next_dispense(&self) -> Result<Option<DispenseOperation>> {
        let Some(id) = self.claim_next(Queue::Dispense)? else {
            return Ok(None);
        };
        self.get_dispense_operation(id)
            .map_err(|e| self.fail_unreadable(Queue::Dispense, id, e))
    }

    pub fn mark_in_progress(&self, id: i64) -> Result<bool> {
        self.transition_to_in_progress(Queue::Dispense, id)
    }

    pub fn mark_completed(&self, id: i64, actual_volumes: &Recipe) -> Result<bool> {
        let json = serde_json::to_string(actual_volumes)?;
        let changed = self.conn().execute(
            "UPDATE pump_operations
             SET status = 'completed', completed_at = ?2, actual_volumes_json = ?3
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, now(), json],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_failed(&self, id: i64, error_message: &str) -> Result<bool> {
        self.fail(Queue::Dispense, id, error_message)
    }

    /// Dispenses left `in_progress`, typically by a crash.
    pub fn stale_dispenses(&self) -> Result<Vec<i64>> {
        self.in_progress_ids(Queue::Dispense)
    }

    // ── Refill queue ────────────────────────────────────────────

    pub fn enqueue_refill(
        &self,
        protocol_id: &str,
        pump_address: u8,
        operation_type: RefillType,
        volume_ul: f64,
        direction: Option<Direction>,
        ingredient_name: Option<&str>,
    ) -> Result<i64> {
        if !(volume_ul.is_finite() && volume_ul > 0.0) {
            return Err(PumpError::configuration("refill volume must be positive"));
        }
        let direction = direction.unwrap_or(operation_type.default_direction());
        if direction == Direction::Reverse {
            return Err(PumpError::configuration("refill direction must be INF or WDR"));
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pump_refill_operations
                 (protocol_id, pump_address, operation_type, volume_ul, direction,
                  ingredient_name, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                protocol_id,
                pump_address,
                operation_type,
                volume_ul,
                direction.code(),
                ingredient_name,
                now()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_refill_operation(&self, id: i64) -> Result<Option<RefillOperation>> {
        let conn = self.conn();
        let op = conn
            .query_row(
                &format!("SELECT {REFILL_COLUMNS} FROM pump_refill_operations WHERE id = ?1"),
                params![id],
                refill_from_row,
            )
            .optional()?;
        Ok(op)
    }

    pub fn get_pending_refills(&self, limit: usize) -> Result<Vec<RefillOperation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REFILL_COLUMNS} FROM pump_refill_operations
             WHERE status = 'pending'
             ORDER BY created_at ASC, id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit_param(limit)], refill_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn claim_next_refill(&self) -> Result<Option<RefillOperation>> {
        let Some(id) = self.claim_next(Queue::Refill)? else {
            return Ok(None);
        };
        self.get_refill_operation(id)
            .map_err(|e| self.fail_unreadable(Queue::Refill, id, e))
    }

    pub fn mark_refill_in_progress(&self, id: i64) -> Result<bool> {
        self.transition_to_in_progress(Queue::Refill, id)
    }

    pub fn mark_refill_completed(&self, id: i64) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE pump_refill_operations
             SET status = 'completed', completed_at = ?2
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, now()],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_refill_failed(&self, id: i64, error_message: &str) -> Result<bool> {
        self.fail(Queue::Refill, id, error_message)
    }

    pub fn stale_refills(&self) -> Result<Vec<i64>> {
        self.in_progress_ids(Queue::Refill)
    }

    // ── Shared lifecycle ────────────────────────────────────────

    fn claim_next(&self, queue: Queue) -> Result<Option<i64>> {
        let table = queue.table();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT id FROM {table} WHERE status = 'pending'
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };
        let changed = tx.execute(
            &format!(
                "UPDATE {table} SET status = 'in_progress', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'"
            ),
            params![id, now()],
        )?;
        tx.commit()?;
        debug!("store: claimed {table}#{id}");
        Ok((changed == 1).then_some(id))
    }

    fn transition_to_in_progress(&self, queue: Queue, id: i64) -> Result<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE {} SET status = 'in_progress', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                queue.table()
            ),
            params![id, now()],
        )?;
        Ok(changed == 1)
    }

    fn fail(&self, queue: Queue, id: i64, error_message: &str) -> Result<bool> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE {} SET status = 'failed', completed_at = ?2, error_message = ?3
                 WHERE id = ?1 AND status = 'in_progress'",
                queue.table()
            ),
            params![id, now(), error_message],
        )?;
        Ok(changed == 1)
    }

    fn fail_unreadable(&self, queue: Queue, id: i64, error: PumpError) -> PumpError {
        let message = format!("unreadable operation: {error}");
        match self.fail(queue, id, &message) {
            Ok(_) => warn!("store: {}#{id} failed: {message}", queue.table()),
            Err(e) => warn!("store: {}#{id} could not be marked failed: {e}", queue.table()),
        }
        error
    }

    fn in_progress_ids(&self, queue: Queue) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM {} WHERE status = 'in_progress' ORDER BY id",
            queue.table()
        ))?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<Vec<i64>>>()?)
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
