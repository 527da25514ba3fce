//! Dispense execution: recipe planning and the three bus strategies.
//!
//! ```text
//!  recipe ──▶ plan (pump lookup, diluent remainder) ──▶ pool ──▶ strategy
//!                                                              ├─ burst
//!                                                              ├─ simultaneous
//!                                                              └─ sequential
//! ```
//!
//! Every pump that was started is stopped again before a failure is
//! returned.  Stopping halts motion; it does not undo liquid already moved.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use crate::codec::{Direction, max_rate_for_diameter};
use crate::config::{PumpAddressConfig, PumpConfig, validate_pump_config};
use crate::drivers::burst::{BurstCommandBuilder, BurstPumpConfig, send_burst};
use crate::drivers::{PumpDriver, dispense_duration};
use crate::error::PumpError;
use crate::pool::{PumpPool, PumpSet};
use crate::store::{DispenseOperation, Store, operations::Recipe};
use crate::volume::VolumeTracker;

use super::events::Strategy;
use super::ports::TimePort;

/// Volumes at or below this are left out of the plan.
const NEGLIGIBLE_UL: f64 = 1e-3;
/// Slack when comparing the recipe sum against the total volume.
const TOTAL_SLACK_UL: f64 = 1e-6;

// ───────────────────────────────────────────────────────────────
// Failure
// ───────────────────────────────────────────────────────────────

/// Every error met while handling one operation.  Stored verbatim (joined)
/// as the operation's `error_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispenseFailure {
    pub errors: Vec<String>,
}

impl DispenseFailure {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    pub fn message(&self) -> String {
        self.errors.join("; ")
    }
}

impl From<PumpError> for DispenseFailure {
    fn from(e: PumpError) -> Self {
        match e {
            PumpError::BurstValidation(errors) => Self { errors },
            other => Self {
                errors: vec![other.to_string()],
            },
        }
    }
}

impl fmt::Display for DispenseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

// ───────────────────────────────────────────────────────────────
// Plan
// ───────────────────────────────────────────────────────────────

/// One ingredient resolved to its pump.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDispense {
    pub ingredient: String,
    pub pump: PumpAddressConfig,
    /// Requested (tracked) volume.  The pump is commanded
    /// [`PumpAddressConfig::commanded_volume_ul`] of this.
    pub volume_ul: f64,
}

impl PlannedDispense {
    fn commanded_ul(&self) -> f64 {
        self.pump.commanded_volume_ul(self.volume_ul)
    }

    fn label(&self) -> String {
        format!("{} (pump {:02})", self.ingredient, self.pump.address)
    }
}

/// Map a recipe onto the configured pumps.
///
/// Unknown ingredients are all reported together.  With a total volume
/// configured, the diluent pump gets whatever the other ingredients leave,
/// replacing any diluent amount in the recipe.
pub fn plan_dispense(config: &PumpConfig, recipe: &Recipe) -> Result<Vec<PlannedDispense>, DispenseFailure> {
    let mut errors = Vec::new();
    let mut plan = Vec::new();
    let diluent = config.diluent();

    for (ingredient, &volume_ul) in recipe {
        let Some(pump) = config.pump_for_ingredient(ingredient) else {
            errors.push(format!("no pump configured for ingredient '{ingredient}'"));
            continue;
        };
        if !volume_ul.is_finite() || volume_ul < 0.0 {
            errors.push(format!("invalid volume {volume_ul} uL for '{ingredient}'"));
            continue;
        }
        if diluent.is_some_and(|d| d.address == pump.address) {
            continue;
        }
        plan.push(PlannedDispense {
            ingredient: pump.ingredient.clone(),
            pump: pump.clone(),
            volume_ul,
        });
    }

    if let Some(diluent) = diluent {
        let requested = recipe
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&diluent.ingredient))
            .map(|(_, v)| *v);
        let volume = match config.total_volume_ul() {
            Some(total) => {
                let others: f64 = plan.iter().map(|p| p.volume_ul).sum();
                let remainder = total - others;
                if remainder < -TOTAL_SLACK_UL {
                    errors.push(format!(
                        "recipe needs {others:.1} uL but the protocol total is {total:.1} uL"
                    ));
                }
                if let Some(r) = requested.filter(|r| (r - remainder).abs() > 1.0) {
                    debug!(
                        "diluent {}: recipe asked {r:.1} uL, using remainder {remainder:.1} uL",
                        diluent.ingredient
                    );
                }
                Some(remainder.max(0.0))
            }
            None => requested,
        };
        if let Some(volume_ul) = volume {
            plan.push(PlannedDispense {
                ingredient: diluent.ingredient.clone(),
                pump: diluent.clone(),
                volume_ul,
            });
        }
    }

    if !errors.is_empty() {
        return Err(DispenseFailure::new(errors));
    }

    plan.retain(|p| {
        let keep = p.volume_ul > NEGLIGIBLE_UL;
        if !keep {
            debug!("skipping {}: nothing to dispense", p.label());
        }
        keep
    });

    for item in &plan {
        if let Ok(diameter) = item.pump.diameter_mm() {
            let max = max_rate_for_diameter(diameter);
            if config.dispensing_rate_ul_min > max {
                warn!(
                    "{}: rate {} uL/min exceeds {max:.0} uL/min for a {diameter} mm syringe",
                    item.label(),
                    config.dispensing_rate_ul_min
                );
            }
        }
    }
    Ok(plan)
}

/// Burst only when asked for, every address fits a burst, and pumps run
/// together anyway.
pub fn select_strategy(config: &PumpConfig) -> Strategy {
    if config.burst_eligible() {
        Strategy::Burst
    } else if config.simultaneous_dispensing {
        Strategy::Simultaneous
    } else {
        Strategy::Sequential
    }
}

// ───────────────────────────────────────────────────────────────
// Execution
// ───────────────────────────────────────────────────────────────

/// Result of a successful dispense.
#[derive(Debug, Clone)]
pub struct DispenseReport {
    pub protocol_id: String,
    pub config: PumpConfig,
    pub strategy: Strategy,
    /// Requested volume per ingredient, as moved.
    pub actual: Recipe,
    /// Time spent waiting on pump motion.
    pub wait: Duration,
}

/// Options the orchestrator passes through.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispenseOptions {
    pub block_on_insufficient_volume: bool,
}

/// Resolve, plan, and run one dispense operation against the bus.
pub fn execute_dispense(
    pool: &mut PumpPool,
    store: &Store,
    op: &DispenseOperation,
    options: DispenseOptions,
) -> Result<DispenseReport, DispenseFailure> {
    let (protocol_id, config) = store.resolve_session(&op.session_id)?;
    validate_pump_config(&config)?;
    if !config.enabled {
        return Err(PumpError::Configuration(format!(
            "pumps are disabled for protocol {protocol_id}"
        ))
        .into());
    }

    let plan = plan_dispense(&config, &op.recipe)?;
    let actual: Recipe = plan
        .iter()
        .map(|p| (p.ingredient.clone(), p.volume_ul))
        .collect();

    if options.block_on_insufficient_volume {
        let shortages = VolumeTracker::new(store).check_sufficient(&protocol_id, &config, &actual)?;
        if !shortages.is_empty() {
            return Err(DispenseFailure::new(
                shortages
                    .iter()
                    .map(|s| {
                        format!(
                            "insufficient {}: need {:.1} uL, {:.1} uL left",
                            s.ingredient, s.requested_ul, s.available_ul
                        )
                    })
                    .collect(),
            ));
        }
    }

    let strategy = select_strategy(&config);
    if plan.is_empty() {
        info!("op {}: nothing to dispense", op.id);
        return Ok(DispenseReport {
            protocol_id,
            config,
            strategy,
            actual,
            wait: Duration::ZERO,
        });
    }

    let clock = pool.clock();
    let key = op.session_id.as_str();
    pool.get_or_create_pumps(key, &config)?;
    info!(
        "op {}: {strategy} dispense of {} ingredient(s) for session {key}",
        op.id,
        plan.len()
    );

    let wait = match strategy {
        Strategy::Burst => dispense_burst(pool, key, &config, &plan, clock.as_ref())?,
        Strategy::Simultaneous => {
            let pumps = cached(pool, key)?;
            dispense_simultaneous(pumps, &config, &plan, clock.as_ref())?
        }
        Strategy::Sequential => {
            let pumps = cached(pool, key)?;
            dispense_sequential(pumps, &config, &plan)?
        }
    };

    Ok(DispenseReport {
        protocol_id,
        config,
        strategy,
        actual,
        wait,
    })
}

fn cached<'p>(pool: &'p mut PumpPool, key: &str) -> Result<&'p mut PumpSet, DispenseFailure> {
    pool.pumps_mut(key)
        .ok_or_else(|| PumpError::Connection(format!("no pumps cached for {key}")).into())
}

fn driver<'s>(
    pumps: &'s mut PumpSet,
    item: &PlannedDispense,
) -> Result<&'s mut PumpDriver, String> {
    pumps
        .get_mut(&item.ingredient)
        .ok_or_else(|| format!("{}: pump not initialised", item.label()))
}

/// Stop every listed pump, collecting failures.
fn stop_all(pumps: &mut PumpSet, items: &[&PlannedDispense]) -> Vec<String> {
    let mut errors = Vec::new();
    for item in items {
        match driver(pumps, item) {
            Ok(d) => {
                if let Err(e) = d.stop() {
                    errors.push(format!("{}: stop failed: {e}", item.label()));
                }
            }
            Err(e) => errors.push(e),
        }
    }
    errors
}

// ── Sequential ──────────────────────────────────────────────────

fn dispense_sequential(
    pumps: &mut PumpSet,
    config: &PumpConfig,
    plan: &[PlannedDispense],
) -> Result<Duration, DispenseFailure> {
    let mut waited = Duration::ZERO;
    for item in plan {
        let d = driver(pumps, item).map_err(|e| DispenseFailure::new(vec![e]))?;
        match d.dispense_volume(
            item.commanded_ul(),
            Some(config.dispensing_rate_ul_min),
            true,
            item.pump.volume_unit,
        ) {
            Ok(duration) => waited += duration,
            Err(e) => {
                let mut errors = vec![format!("{}: {e}", item.label())];
                if let Err(stop) = d.stop() {
                    errors.push(format!("{}: stop failed: {stop}", item.label()));
                }
                return Err(DispenseFailure::new(errors));
            }
        }
    }
    Ok(waited)
}

// ── Simultaneous ────────────────────────────────────────────────

fn dispense_simultaneous(
    pumps: &mut PumpSet,
    config: &PumpConfig,
    plan: &[PlannedDispense],
    clock: &dyn TimePort,
) -> Result<Duration, DispenseFailure> {
    let rate = config.dispensing_rate_ul_min;

    let mut errors = Vec::new();
    for item in plan {
        let configured = driver(pumps, item).and_then(|d| {
            d.set_direction(Direction::Infuse)
                .and_then(|()| d.set_rate(rate))
                .and_then(|()| d.set_volume(item.commanded_ul(), item.pump.volume_unit))
                .map_err(|e| format!("{}: {e}", item.label()))
        });
        if let Err(e) = configured {
            errors.push(e);
        }
    }
    if !errors.is_empty() {
        return Err(DispenseFailure::new(errors));
    }

    let mut started: Vec<&PlannedDispense> = Vec::with_capacity(plan.len());
    for item in plan {
        let run = driver(pumps, item).and_then(|d| d.start().map_err(|e| format!("{}: {e}", item.label())));
        if let Err(e) = run {
            warn!("start failed, stopping {} running pump(s)", started.len());
            let mut errors = vec![e];
            errors.extend(stop_all(pumps, &started));
            return Err(DispenseFailure::new(errors));
        }
        started.push(item);
    }

    let wait = plan
        .iter()
        .map(|p| dispense_duration(p.commanded_ul(), rate))
        .max()
        .unwrap_or_default();
    debug!("all pumps running, waiting {:.2}s", wait.as_secs_f64());
    clock.sleep(wait);

    let errors = stop_all(pumps, &started);
    if errors.is_empty() {
        Ok(wait)
    } else {
        Err(DispenseFailure::new(errors))
    }
}

// ── Burst ───────────────────────────────────────────────────────

fn dispense_burst(
    pool: &mut PumpPool,
    key: &str,
    config: &PumpConfig,
    plan: &[PlannedDispense],
    clock: &dyn TimePort,
) -> Result<Duration, DispenseFailure> {
    let mut burst = Vec::with_capacity(plan.len());
    for item in plan {
        burst.push(BurstPumpConfig {
            address: item.pump.address,
            rate_ul_min: config.dispensing_rate_ul_min,
            volume_ul: item.volume_ul,
            diameter_mm: item.pump.diameter_mm()?,
            direction: Direction::Infuse,
            volume_unit: item.pump.volume_unit,
            dual_syringe: item.pump.dual_syringe,
        });
    }
    let builder = BurstCommandBuilder::new(burst)?;

    if !pool.is_burst_initialized(key) {
        let setup = setup_builder(config)?;
        let bus = bus_driver(cached(pool, key)?, key)?;
        for line in setup.setup_sequence() {
            send_burst(bus, &line, setup.pumps())?;
        }
        pool.set_burst_initialized(key, true);
        info!("burst parameters sent for session {key}");
    }

    let pumps = cached(pool, key)?;
    let all: Vec<&PlannedDispense> = plan.iter().collect();
    if let Err(mut failure) = program_and_run(pumps, key, &builder, plan) {
        failure.errors.extend(stop_all(pumps, &all));
        return Err(failure);
    }

    let wait = builder.cycle_duration();
    debug!("burst running, waiting {:.2}s", wait.as_secs_f64());
    clock.sleep(wait);

    let errors = stop_all(pumps, &all);
    if errors.is_empty() {
        Ok(wait)
    } else {
        Err(DispenseFailure::new(errors))
    }
}

/// Setup lines cover every configured pump, not just the ones dispensing
/// this cycle: a pump first used in a later cycle still needs its unit and
/// direction before its first volume value.
fn setup_builder(config: &PumpConfig) -> Result<BurstCommandBuilder, DispenseFailure> {
    let mut pumps = Vec::with_capacity(config.pumps.len());
    for pump in &config.pumps {
        pumps.push(BurstPumpConfig {
            address: pump.address,
            rate_ul_min: config.dispensing_rate_ul_min,
            volume_ul: 0.0,
            diameter_mm: pump.diameter_mm()?,
            direction: Direction::Infuse,
            volume_unit: pump.volume_unit,
            dual_syringe: pump.dual_syringe,
        });
    }
    Ok(BurstCommandBuilder::for_setup(pumps)?)
}

/// Send the volume line, check it took, then start every pump at once.
fn program_and_run(
    pumps: &mut PumpSet,
    key: &str,
    builder: &BurstCommandBuilder,
    plan: &[PlannedDispense],
) -> Result<(), DispenseFailure> {
    send_burst(bus_driver(pumps, key)?, &builder.volume(), builder.pumps())?;
    verify_burst_volumes(pumps, plan);
    send_burst(bus_driver(pumps, key)?, &builder.run(), builder.pumps())?;
    Ok(())
}

/// Any driver on the chain can carry a burst line.
fn bus_driver<'s>(pumps: &'s PumpSet, key: &str) -> Result<&'s PumpDriver, PumpError> {
    pumps
        .values()
        .next()
        .ok_or_else(|| PumpError::Connection(format!("no pumps cached for {key}")))
}

/// Burst replies cannot be trusted, so read each programmed volume back
/// individually.  Mismatches are logged, not fatal.
fn verify_burst_volumes(pumps: &mut PumpSet, plan: &[PlannedDispense]) {
    for item in plan {
        let Some(d) = pumps.get_mut(&item.ingredient) else {
            continue;
        };
        let expected = item.commanded_ul();
        match d.query_volume_ul() {
            Ok(Some(actual)) if (actual - expected).abs() > (expected * 0.01).max(1.0) => warn!(
                "{}: burst volume read back {actual:.1} uL, expected {expected:.1} uL",
                item.label()
            ),
            Ok(_) => {}
            Err(e) => warn!("{}: burst volume read-back failed: {e}", item.label()),
        }
    }
}
