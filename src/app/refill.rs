//! Refill handling: one pump, one withdraw or purge move.
//!
//! Refills belong to a protocol rather than a session, so the pump is opened
//! under its own pool key and released again afterwards.  The diameter is
//! re-sent first because the syringe may have been swapped since last use.
//! Sessions cached on the same bus are dropped once the move is done.

use std::time::Duration;

use log::{info, warn};

use crate::codec::Direction;
use crate::config::{PumpAddressConfig, PumpConfig};
use crate::error::{PumpError, Result};
use crate::pool::PumpPool;
use crate::store::{RefillOperation, Store};

/// Result of a completed refill move.
#[derive(Debug, Clone)]
pub struct RefillReport {
    pub protocol_id: String,
    pub pump: PumpAddressConfig,
    pub direction: Direction,
    /// Tracked volume moved.  The pump is commanded half of this on a
    /// dual-syringe mount.
    pub volume_ul: f64,
    pub elapsed: Duration,
}

impl RefillReport {
    /// Change to the tracked syringe volume: withdrawing fills, infusing
    /// empties.
    pub fn ledger_delta_ul(&self) -> f64 {
        match self.direction {
            Direction::Withdraw => self.volume_ul,
            _ => -self.volume_ul,
        }
    }
}

fn pool_key(protocol_id: &str) -> String {
    format!("protocol:{protocol_id}")
}

/// Drive the pump named by `op` through its move at `rate_ul_min`.
pub fn execute_refill(
    pool: &mut PumpPool,
    store: &Store,
    op: &RefillOperation,
    rate_ul_min: f64,
) -> Result<RefillReport> {
    let config = store.protocol_pump_config(&op.protocol_id)?.ok_or_else(|| {
        PumpError::Configuration(format!(
            "protocol {} has no pump configuration",
            op.protocol_id
        ))
    })?;
    let pump = config.pump_for_address(op.pump_address).cloned().ok_or_else(|| {
        PumpError::Configuration(format!(
            "protocol {} has no pump at address {:02}",
            op.protocol_id, op.pump_address
        ))
    })?;
    if let Some(name) = op
        .ingredient_name
        .as_deref()
        .filter(|n| !n.eq_ignore_ascii_case(&pump.ingredient))
    {
        warn!(
            "refill {}: requested for '{name}' but pump {:02} holds '{}'",
            op.id, pump.address, pump.ingredient
        );
    }

    let single = PumpConfig {
        pumps: vec![pump.clone()],
        ..config
    };
    let key = pool_key(&op.protocol_id);
    let moved = run_move(pool, &key, &single, &pump, op, rate_ul_min);
    pool.cleanup(&key);
    // Session drivers on this bus no longer know the pump's direction, rate
    // or unit, and any burst setup they sent is void.
    pool.invalidate_port(&single.serial_port);
    let elapsed = moved?;

    info!(
        "refill {}: pump {:02} {} {:.1} uL in {:.2}s",
        op.id,
        pump.address,
        op.direction.code(),
        op.volume_ul,
        elapsed.as_secs_f64()
    );
    Ok(RefillReport {
        protocol_id: op.protocol_id.clone(),
        pump,
        direction: op.direction,
        volume_ul: op.volume_ul,
        elapsed,
    })
}

fn run_move(
    pool: &mut PumpPool,
    key: &str,
    config: &PumpConfig,
    pump: &PumpAddressConfig,
    op: &RefillOperation,
    rate_ul_min: f64,
) -> Result<Duration> {
    let diameter = pump.diameter_mm()?;
    let driver = pool
        .get_or_create_pumps(key, config)?
        .get_mut(&pump.ingredient)
        .ok_or_else(|| PumpError::Connection(format!("pump {:02} not initialised", pump.address)))?;

    driver.set_diameter(diameter)?;
    let moved = driver.move_volume(
        op.direction,
        pump.commanded_volume_ul(op.volume_ul),
        rate_ul_min,
        pump.volume_unit,
    );
    if moved.is_err() {
        if let Err(e) = driver.stop() {
            warn!("refill {}: stop after failure also failed: {e}", op.id);
        }
    }
    moved
}
