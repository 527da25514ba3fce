//! Dispense service: the hexagonal core.
//!
//! [`DispenseService`] polls the operation store, claims one operation per
//! tick and drives it to a terminal status.  All I/O flows through the
//! pool's port traits and the [`EventSink`] passed at call sites, so the
//! whole loop runs against the emulator in tests.
//!
//! ```text
//!                  ┌──────────────────────────┐
//!  Store ─claim──▶ │     DispenseService      │ ──▶ EventSink
//!                  │ dispense · refill · vol  │
//!  PumpPool ◀──────└──────────────────────────┘
//! ```
//!
//! Per tick: `Idle → claim → resolve protocol → (init pumps) → dispense →
//! volume tracking → Idle`.  Dispenses outrank refills.  An operation is
//! claimed (moved out of `pending`) before any bus traffic, so a crash
//! leaves it `in_progress` for manual recovery instead of re-running it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::pool::PumpPool;
use crate::store::{DispenseOperation, RefillOperation, Store};
use crate::volume::{VolumeAlert, VolumeTracker};

use super::dispense::{DispenseOptions, execute_dispense};
use super::events::{AppEvent, OperationKind, VolumeScope};
use super::ports::{EventSink, TimePort};
use super::refill::execute_refill;

// ───────────────────────────────────────────────────────────────
// DispenseService
// ───────────────────────────────────────────────────────────────

pub struct DispenseService {
    clock: Arc<dyn TimePort>,
    options: DispenseOptions,
    refill_rate_ul_min: f64,
    history_retention_days: Option<u32>,
    completed: u64,
    failed: u64,
}

impl DispenseService {
    pub fn new(config: &ServiceConfig, clock: Arc<dyn TimePort>) -> Self {
        Self {
            clock,
            options: DispenseOptions {
                block_on_insufficient_volume: config.block_on_insufficient_volume,
            },
            refill_rate_ul_min: config.refill_rate_ul_min,
            history_retention_days: config.history_retention_days,
            completed: 0,
            failed: 0,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Report operations a previous run left `in_progress` and prune old
    /// volume history.  Stale rows are never re-claimed.
    pub fn startup(&self, store: &Store, sink: &mut impl EventSink) -> Result<()> {
        for operation_id in store.stale_dispenses()? {
            sink.emit(&AppEvent::StaleOperation {
                kind: OperationKind::Dispense,
                operation_id,
            });
        }
        for operation_id in store.stale_refills()? {
            sink.emit(&AppEvent::StaleOperation {
                kind: OperationKind::Refill,
                operation_id,
            });
        }
        if let Some(days) = self.history_retention_days {
            let cutoff = self.clock.now() - chrono::Duration::days(i64::from(days));
            let rows = store.prune_history(cutoff)?;
            sink.emit(&AppEvent::HistoryPruned { rows });
        }
        Ok(())
    }

    /// Claim and run at most one operation.  Returns whether anything was
    /// claimed.  A failing operation is recorded as failed, not returned as
    /// an error; only store failures propagate.
    pub fn tick(&mut self, pool: &mut PumpPool, store: &Store, sink: &mut impl EventSink) -> Result<bool> {
        if let Some(op) = store.claim_next_dispense()? {
            sink.emit(&AppEvent::Claimed {
                kind: OperationKind::Dispense,
                operation_id: op.id,
            });
            self.run_dispense(pool, store, &op, sink)?;
            return Ok(true);
        }
        if let Some(op) = store.claim_next_refill()? {
            sink.emit(&AppEvent::Claimed {
                kind: OperationKind::Refill,
                operation_id: op.id,
            });
            self.run_refill(pool, store, &op, sink)?;
            return Ok(true);
        }
        Ok(false)
    }

    // ── Dispense ──────────────────────────────────────────────

    fn run_dispense(
        &mut self,
        pool: &mut PumpPool,
        store: &Store,
        op: &DispenseOperation,
        sink: &mut impl EventSink,
    ) -> Result<()> {
        let started = self.clock.now();
        match execute_dispense(pool, store, op, self.options) {
            Ok(report) => {
                store.mark_completed(op.id, &report.actual)?;
                self.completed += 1;

                let at = self.clock.now();
                let tracker = VolumeTracker::new(store);
                let session = tracker.update_volume_after_dispense(
                    &op.session_id,
                    &report.config,
                    &report.actual,
                    Some(op.cycle_number),
                    at,
                );
                emit_alerts(session, VolumeScope::Session(op.session_id.clone()), sink);
                let global = tracker.update_global_after_dispense(
                    &report.protocol_id,
                    &report.config,
                    &report.actual,
                    Some(op.cycle_number),
                    at,
                );
                emit_alerts(global, VolumeScope::Protocol(report.protocol_id.clone()), sink);

                sink.emit(&AppEvent::DispenseCompleted {
                    operation_id: op.id,
                    session_id: op.session_id.clone(),
                    cycle_number: op.cycle_number,
                    strategy: report.strategy,
                    elapsed: elapsed_since(started, self.clock.now()),
                });
            }
            Err(failure) => {
                let message = failure.message();
                store.mark_failed(op.id, &message)?;
                self.failed += 1;
                sink.emit(&AppEvent::DispenseFailed {
                    operation_id: op.id,
                    error: message,
                });
            }
        }
        Ok(())
    }

    // ── Refill ────────────────────────────────────────────────

    fn run_refill(
        &mut self,
        pool: &mut PumpPool,
        store: &Store,
        op: &RefillOperation,
        sink: &mut impl EventSink,
    ) -> Result<()> {
        match execute_refill(pool, store, op, self.refill_rate_ul_min) {
            Ok(report) => {
                store.mark_refill_completed(op.id)?;
                self.completed += 1;
                let moved = VolumeTracker::new(store).apply_global_move(
                    &report.protocol_id,
                    &report.pump,
                    report.ledger_delta_ul(),
                    self.clock.now(),
                );
                if let Err(e) = moved {
                    warn!("refill {}: volume tracking not updated: {e}", op.id);
                }
                sink.emit(&AppEvent::RefillCompleted {
                    operation_id: op.id,
                    pump_address: report.pump.address,
                    withdraw: report.ledger_delta_ul() > 0.0,
                    volume_ul: report.volume_ul,
                });
            }
            Err(e) => {
                let message = e.to_string();
                store.mark_refill_failed(op.id, &message)?;
                self.failed += 1;
                sink.emit(&AppEvent::RefillFailed {
                    operation_id: op.id,
                    error: message,
                });
            }
        }
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    pub fn failed_count(&self) -> u64 {
        self.failed
    }

    /// Stop every pump and close every port.  Called once on shutdown.
    pub fn shutdown(&self, pool: &mut PumpPool, sink: &mut impl EventSink) {
        info!(
            "service: shutting down after {} completed / {} failed operation(s)",
            self.completed, self.failed
        );
        pool.cleanup_all();
        sink.emit(&AppEvent::Stopped);
    }
}

/// Tracking problems never fail a dispense that already happened.
fn emit_alerts(alerts: Result<Vec<VolumeAlert>>, scope: VolumeScope, sink: &mut impl EventSink) {
    let alerts = match alerts {
        Ok(alerts) => alerts,
        Err(e) => {
            error!("volume tracking for {scope} not updated: {e}");
            return;
        }
    };
    for alert in alerts {
        let event = match alert {
            VolumeAlert::Low {
                pump_address,
                ingredient,
                remaining_ul,
                threshold_ul,
            } => AppEvent::VolumeLow {
                scope: scope.clone(),
                pump_address,
                ingredient,
                remaining_ul,
                threshold_ul,
            },
            VolumeAlert::RanEmpty {
                pump_address,
                ingredient,
            } => AppEvent::RanEmpty {
                scope: scope.clone(),
                pump_address,
                ingredient,
            },
        };
        sink.emit(&event);
    }
}

fn elapsed_since(started: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - started).to_std().unwrap_or_default()
}
