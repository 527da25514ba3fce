//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing each application event as one log
//! line.  The web application reads operation results from the database, so
//! this is the operator's view of the service.

use log::{error, info, warn};

use crate::app::events::AppEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`AppEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Started { db_path, simulate } => {
                info!(
                    "START | db={db_path} | bus={}",
                    if *simulate { "simulated" } else { "serial" }
                );
            }
            AppEvent::StaleOperation { kind, operation_id } => {
                warn!(
                    "STALE | {kind} operation {operation_id} left in_progress by a previous run; \
                     needs manual recovery"
                );
            }
            AppEvent::Claimed { kind, operation_id } => {
                info!("CLAIM | {kind} operation {operation_id}");
            }
            AppEvent::DispenseCompleted {
                operation_id,
                session_id,
                cycle_number,
                strategy,
                elapsed,
            } => {
                info!(
                    "DISPENSE | op={operation_id} session={session_id} cycle={cycle_number} | \
                     {strategy} | {:.2}s",
                    elapsed.as_secs_f64()
                );
            }
            AppEvent::DispenseFailed { operation_id, error: e } => {
                error!("DISPENSE | op={operation_id} failed: {e}");
            }
            AppEvent::RefillCompleted {
                operation_id,
                pump_address,
                withdraw,
                volume_ul,
            } => {
                info!(
                    "REFILL | op={operation_id} pump={pump_address:02} | {} {volume_ul:.1} uL",
                    if *withdraw { "withdrew" } else { "purged" }
                );
            }
            AppEvent::RefillFailed { operation_id, error: e } => {
                error!("REFILL | op={operation_id} failed: {e}");
            }
            AppEvent::VolumeLow {
                scope,
                pump_address,
                ingredient,
                remaining_ul,
                threshold_ul,
            } => {
                warn!(
                    "VOLUME | {scope} | pump {pump_address:02} ({ingredient}) low: \
                     {remaining_ul:.1} uL left, threshold {threshold_ul:.1} uL"
                );
            }
            AppEvent::RanEmpty {
                scope,
                pump_address,
                ingredient,
            } => {
                error!("VOLUME | {scope} | pump {pump_address:02} ({ingredient}) ran empty");
            }
            AppEvent::HistoryPruned { rows } => {
                info!("PRUNE | removed {rows} volume history row(s)");
            }
            AppEvent::Stopped => {
                info!("STOP | pumps stopped, ports closed");
            }
        }
    }
}
