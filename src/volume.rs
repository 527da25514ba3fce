//! Per-ingredient volume tracking.
//!
//! Two ledgers are kept:
//! - **session**: what one experiment session has drawn from each syringe,
//! - **global**: per `(protocol, pump address)`, surviving across sessions
//!   because the physical syringe does.
//!
//! Invariant: `0 <= current_volume_ul <= max_capacity_ul`.  Dispenses clamp
//! at zero and flag the syringe as having run empty; refills outside the
//! range are rejected.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::config::{PumpAddressConfig, PumpConfig};
use crate::error::{PumpError, Result};
use crate::store::{HistoryEntry, HistoryEventType, Store, VolumeRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeState {
    pub current_volume_ul: f64,
    pub max_capacity_ul: f64,
    pub alert_threshold_ul: f64,
    pub total_dispensed_ul: f64,
    pub last_dispensed_at: Option<DateTime<Utc>>,
    pub last_refilled_at: Option<DateTime<Utc>>,
}

/// Result of applying a dispense to a ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispenseOutcome {
    pub before_ul: f64,
    pub after_ul: f64,
    /// The dispense took the syringe from positive to zero.
    pub ran_empty: bool,
    pub below_alert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefillOutcome {
    pub before_ul: f64,
    pub after_ul: f64,
    pub delta_ul: f64,
}

impl VolumeState {
    /// An initial volume above capacity is clamped to capacity.
    pub fn new(initial_ul: f64, max_capacity_ul: f64, alert_threshold_ul: f64) -> Self {
        let max_capacity_ul = max_capacity_ul.max(0.0);
        if initial_ul > max_capacity_ul {
            warn!("volume: initial {initial_ul} uL exceeds capacity {max_capacity_ul} uL, clamping");
        }
        Self {
            current_volume_ul: initial_ul.clamp(0.0, max_capacity_ul),
            max_capacity_ul,
            alert_threshold_ul: alert_threshold_ul.max(0.0),
            total_dispensed_ul: 0.0,
            last_dispensed_at: None,
            last_refilled_at: None,
        }
    }

    pub fn is_low(&self) -> bool {
        self.current_volume_ul <= self.alert_threshold_ul
    }

    /// Subtract a dispensed volume, clamping at zero.
    pub fn apply_dispense(&mut self, volume_ul: f64, at: DateTime<Utc>) -> DispenseOutcome {
        let before = self.current_volume_ul;
        let volume_ul = volume_ul.max(0.0);
        let after = (before - volume_ul).max(0.0);
        self.current_volume_ul = after;
        self.total_dispensed_ul += volume_ul;
        self.last_dispensed_at = Some(at);
        DispenseOutcome {
            before_ul: before,
            after_ul: after,
            ran_empty: before > 0.0 && after <= 0.0,
            below_alert: self.is_low(),
        }
    }

    /// Set a new absolute volume after a refill.
    pub fn apply_refill(&mut self, new_total_ul: f64, at: DateTime<Utc>) -> Result<RefillOutcome> {
        if !(new_total_ul.is_finite() && (0.0..=self.max_capacity_ul).contains(&new_total_ul)) {
            return Err(PumpError::Volume(format!(
                "refill to {new_total_ul} uL outside 0-{} uL",
                self.max_capacity_ul
            )));
        }
        let before = self.current_volume_ul;
        self.current_volume_ul = new_total_ul;
        self.last_refilled_at = Some(at);
        Ok(RefillOutcome {
            before_ul: before,
            after_ul: new_total_ul,
            delta_ul: new_total_ul - before,
        })
    }
}

/// A condition worth telling an operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeAlert {
    Low {
        pump_address: u8,
        ingredient: String,
        remaining_ul: f64,
        threshold_ul: f64,
    },
    RanEmpty {
        pump_address: u8,
        ingredient: String,
    },
}

/// Shortfall found by a pre-dispense check.
#[derive(Debug, Clone, PartialEq)]
pub struct Shortage {
    pub ingredient: String,
    pub requested_ul: f64,
    pub available_ul: f64,
}

fn alerts_for(rec: &VolumeRecord, outcome: DispenseOutcome) -> Vec<VolumeAlert> {
    let mut alerts = Vec::new();
    if outcome.ran_empty {
        alerts.push(VolumeAlert::RanEmpty {
            pump_address: rec.pump_address,
            ingredient: rec.ingredient.clone(),
        });
    } else if outcome.below_alert {
        alerts.push(VolumeAlert::Low {
            pump_address: rec.pump_address,
            ingredient: rec.ingredient.clone(),
            remaining_ul: outcome.after_ul,
            threshold_ul: rec.state.alert_threshold_ul,
        });
    }
    alerts
}

fn fresh_record(pump: &PumpAddressConfig, initial_ul: Option<f64>) -> VolumeRecord {
    let capacity = pump.tracked_capacity_ul();
    VolumeRecord {
        pump_address: pump.address,
        ingredient: pump.ingredient.clone(),
        state: VolumeState::new(
            initial_ul.unwrap_or(capacity),
            capacity,
            pump.alert_threshold_ul,
        ),
    }
}

/// Which ledger an operation applies to.
#[derive(Debug, Clone, Copy)]
enum Ledger<'a> {
    Session(&'a str),
    Global(&'a str),
}

/// Ledger operations over the [`Store`].
pub struct VolumeTracker<'a> {
    store: &'a Store,
}

impl<'a> VolumeTracker<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    fn load(&self, ledger: Ledger<'_>, pump: &PumpAddressConfig) -> Result<Option<VolumeRecord>> {
        match ledger {
            Ledger::Session(id) => self.store.session_volume(id, &pump.ingredient),
            Ledger::Global(id) => self.store.global_volume(id, pump.address),
        }
    }

    fn save(&self, ledger: Ledger<'_>, rec: &VolumeRecord, history: HistoryEntry) -> Result<()> {
        match ledger {
            Ledger::Session(id) => self.store.save_session_volume(id, rec, &history),
            Ledger::Global(id) => self.store.save_global_volume(id, rec, &history),
        }
    }

    fn history(
        ledger: Ledger<'_>,
        rec: &VolumeRecord,
        event_type: HistoryEventType,
        before: f64,
        cycle_number: Option<i64>,
        notes: String,
    ) -> HistoryEntry {
        let (session_id, protocol_id) = match ledger {
            Ledger::Session(id) => (Some(id.to_string()), None),
            Ledger::Global(id) => (None, Some(id.to_string())),
        };
        HistoryEntry {
            session_id,
            protocol_id,
            pump_address: rec.pump_address,
            ingredient: rec.ingredient.clone(),
            event_type,
            volume_change_ul: rec.state.current_volume_ul - before,
            volume_before_ul: before,
            volume_after_ul: rec.state.current_volume_ul,
            cycle_number,
            notes,
        }
    }

    fn initialize(
        &self,
        ledger: Ledger<'_>,
        config: &PumpConfig,
        initial_volumes: &BTreeMap<String, f64>,
    ) -> Result<()> {
        for pump in &config.pumps {
            let initial = initial_volumes.get(&pump.ingredient).copied();
            let rec = fresh_record(pump, initial);
            let notes = match initial {
                Some(v) if v > rec.state.max_capacity_ul => {
                    format!("initial {v} uL clamped to capacity")
                }
                Some(_) => "initial volume".to_string(),
                None => "assumed full".to_string(),
            };
            let history = Self::history(ledger, &rec, HistoryEventType::Init, 0.0, None, notes);
            self.save(ledger, &rec, history)?;
        }
        Ok(())
    }

    /// Load the ledger row for `pump`, seeding a full syringe (with an
    /// `init` history row) if none exists yet.
    fn load_or_seed(&self, ledger: Ledger<'_>, pump: &PumpAddressConfig) -> Result<VolumeRecord> {
        if let Some(rec) = self.load(ledger, pump)? {
            return Ok(rec);
        }
        info!(
            "volume: no ledger row for {} (pump {:02}), assuming full",
            pump.ingredient, pump.address
        );
        let rec = fresh_record(pump, None);
        let history = Self::history(
            ledger,
            &rec,
            HistoryEventType::Init,
            0.0,
            None,
            "assumed full".to_string(),
        );
        self.save(ledger, &rec, history)?;
        Ok(rec)
    }

    fn update_after_dispense(
        &self,
        ledger: Ledger<'_>,
        config: &PumpConfig,
        dispensed: &BTreeMap<String, f64>,
        cycle_number: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<Vec<VolumeAlert>> {
        let mut alerts = Vec::new();
        for (ingredient, volume) in dispensed {
            let pump = config.pump_for_ingredient(ingredient).ok_or_else(|| {
                PumpError::Volume(format!("no pump tracks ingredient '{ingredient}'"))
            })?;
            let mut rec = self.load_or_seed(ledger, pump)?;
            let outcome = rec.state.apply_dispense(*volume, at);
            let notes = if outcome.ran_empty {
                format!("requested {volume} uL, syringe ran empty")
            } else {
                String::new()
            };
            let history = Self::history(
                ledger,
                &rec,
                HistoryEventType::Dispense,
                outcome.before_ul,
                cycle_number,
                notes,
            );
            self.save(ledger, &rec, history)?;
            alerts.extend(alerts_for(&rec, outcome));
        }
        Ok(alerts)
    }

    fn record_refill(
        &self,
        ledger: Ledger<'_>,
        pump: &PumpAddressConfig,
        new_total_ul: f64,
        at: DateTime<Utc>,
        notes: String,
    ) -> Result<RefillOutcome> {
        let mut rec = self.load_or_seed(ledger, pump)?;
        let outcome = rec.state.apply_refill(new_total_ul, at)?;
        let history = Self::history(
            ledger,
            &rec,
            HistoryEventType::Refill,
            outcome.before_ul,
            None,
            notes,
        );
        self.save(ledger, &rec, history)?;
        Ok(outcome)
    }

    // ── Session ledger ──────────────────────────────────────────

    /// Seed every configured ingredient at session start.  Missing entries
    /// in `initial_volumes` start full.
    pub fn initialize_volume_tracking(
        &self,
        session_id: &str,
        config: &PumpConfig,
        initial_volumes: &BTreeMap<String, f64>,
    ) -> Result<()> {
        self.initialize(Ledger::Session(session_id), config, initial_volumes)
    }

    pub fn update_volume_after_dispense(
        &self,
        session_id: &str,
        config: &PumpConfig,
        dispensed: &BTreeMap<String, f64>,
        cycle_number: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<Vec<VolumeAlert>> {
        self.update_after_dispense(Ledger::Session(session_id), config, dispensed, cycle_number, at)
    }

    pub fn record_refill_for_session(
        &self,
        session_id: &str,
        pump: &PumpAddressConfig,
        new_total_ul: f64,
        at: DateTime<Utc>,
    ) -> Result<RefillOutcome> {
        self.record_refill(
            Ledger::Session(session_id),
            pump,
            new_total_ul,
            at,
            "manual refill".to_string(),
        )
    }

    // ── Global ledger ───────────────────────────────────────────

    pub fn initialize_global_tracking(
        &self,
        protocol_id: &str,
        config: &PumpConfig,
        initial_volumes: &BTreeMap<String, f64>,
    ) -> Result<()> {
        self.initialize(Ledger::Global(protocol_id), config, initial_volumes)
    }

    pub fn update_global_after_dispense(
        &self,
        protocol_id: &str,
        config: &PumpConfig,
        dispensed: &BTreeMap<String, f64>,
        cycle_number: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<Vec<VolumeAlert>> {
        self.update_after_dispense(Ledger::Global(protocol_id), config, dispensed, cycle_number, at)
    }

    pub fn record_global_refill(
        &self,
        protocol_id: &str,
        pump: &PumpAddressConfig,
        new_total_ul: f64,
        at: DateTime<Utc>,
    ) -> Result<RefillOutcome> {
        self.record_refill(
            Ledger::Global(protocol_id),
            pump,
            new_total_ul,
            at,
            "manual refill".to_string(),
        )
    }

    /// Apply a physical move to the global ledger: a withdraw adds liquid
    /// (capped at capacity), a purge removes it (floored at zero).
    pub fn apply_global_move(
        &self,
        protocol_id: &str,
        pump: &PumpAddressConfig,
        delta_ul: f64,
        at: DateTime<Utc>,
    ) -> Result<RefillOutcome> {
        let ledger = Ledger::Global(protocol_id);
        let current = self.load_or_seed(ledger, pump)?;
        let capacity = current.state.max_capacity_ul;
        let target = (current.state.current_volume_ul + delta_ul).clamp(0.0, capacity);
        let notes = if delta_ul >= 0.0 {
            format!("withdraw {delta_ul} uL")
        } else {
            format!("purge {} uL", -delta_ul)
        };
        self.record_refill(ledger, pump, target, at, notes)
    }

    /// Ingredients whose global ledger cannot cover `requested` (in tracked,
    /// i.e. requested, volume).  Untracked pumps are assumed sufficient.
    pub fn check_sufficient(
        &self,
        protocol_id: &str,
        config: &PumpConfig,
        requested: &BTreeMap<String, f64>,
    ) -> Result<Vec<Shortage>> {
        let mut shortages = Vec::new();
        for (ingredient, volume) in requested {
            let Some(pump) = config.pump_for_ingredient(ingredient) else {
                continue;
            };
            if let Some(rec) = self.load(Ledger::Global(protocol_id), pump)? {
                if rec.state.current_volume_ul + 1e-9 < *volume {
                    shortages.push(Shortage {
                        ingredient: ingredient.clone(),
                        requested_ul: *volume,
                        available_ul: rec.state.current_volume_ul,
                    });
                }
            }
        }
        Ok(shortages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PumpConfig {
        let mut salt = PumpAddressConfig::new(1, "Salt", 26.59);
        salt.dual_syringe = true;
        PumpConfig {
            pumps: vec![PumpAddressConfig::new(0, "Sugar", 26.59), salt],
            ..PumpConfig::default()
        }
    }

    #[test]
    fn overdraw_clamps_to_zero_and_flags_empty() {
        let mut s = VolumeState::new(100.0, 60_000.0, 10.0);
        let out = s.apply_dispense(150.0, Utc::now());
        assert_eq!(s.current_volume_ul, 0.0);
        assert!(out.ran_empty);
        assert_eq!(s.total_dispensed_ul, 150.0);

        // already empty: no second "ran empty"
        let again = s.apply_dispense(10.0, Utc::now());
        assert!(!again.ran_empty);
        assert_eq!(s.current_volume_ul, 0.0);
    }

    #[test]
    fn initial_volume_is_clamped_to_capacity() {
        let s = VolumeState::new(80_000.0, 60_000.0, 2000.0);
        assert_eq!(s.current_volume_ul, 60_000.0);
    }

    #[test]
    fn refill_outside_capacity_is_rejected() {
        let mut s = VolumeState::new(100.0, 1000.0, 10.0);
        assert!(matches!(s.apply_refill(1500.0, Utc::now()), Err(PumpError::Volume(_))));
        assert!(s.apply_refill(-1.0, Utc::now()).is_err());
        let out = s.apply_refill(900.0, Utc::now()).unwrap();
        assert_eq!(out.delta_ul, 800.0);
        assert!(s.last_refilled_at.is_some());
    }

    #[test]
    fn session_tracking_writes_history_rows() {
        let store = Store::open_in_memory().unwrap();
        let tracker = VolumeTracker::new(&store);
        let cfg = config();
        let initial: BTreeMap<String, f64> = [("Sugar".to_string(), 100.0)].into();
        tracker.initialize_volume_tracking("s1", &cfg, &initial).unwrap();

        let dispensed: BTreeMap<String, f64> = [("Sugar".to_string(), 150.0)].into();
        let alerts = tracker
            .update_volume_after_dispense("s1", &cfg, &dispensed, Some(3), Utc::now())
            .unwrap();
        assert_eq!(
            alerts,
            vec![VolumeAlert::RanEmpty { pump_address: 0, ingredient: "Sugar".into() }]
        );

        let sugar = store.session_volume("s1", "Sugar").unwrap().unwrap();
        assert_eq!(sugar.state.current_volume_ul, 0.0);

        let history = store.session_volume_history("s1", 10).unwrap();
        let last = &history[0].entry;
        assert_eq!(last.event_type, HistoryEventType::Dispense);
        assert_eq!(last.volume_before_ul, 100.0);
        assert_eq!(last.volume_after_ul, 0.0);
        assert_eq!(last.cycle_number, Some(3));
    }

    #[test]
    fn dual_syringe_capacity_is_doubled_in_global_ledger() {
        let store = Store::open_in_memory().unwrap();
        let tracker = VolumeTracker::new(&store);
        let cfg = config();
        tracker
            .initialize_global_tracking("p1", &cfg, &BTreeMap::new())
            .unwrap();

        let salt = store.global_volume("p1", 1).unwrap().unwrap();
        assert_eq!(salt.state.max_capacity_ul, 120_000.0);
        assert_eq!(salt.state.current_volume_ul, 120_000.0);
    }

    #[test]
    fn global_ledger_persists_across_sessions() {
        let store = Store::open_in_memory().unwrap();
        let tracker = VolumeTracker::new(&store);
        let cfg = config();
        let d: BTreeMap<String, f64> = [("Sugar".to_string(), 1000.0)].into();

        tracker.update_global_after_dispense("p1", &cfg, &d, Some(1), Utc::now()).unwrap();
        tracker.update_global_after_dispense("p1", &cfg, &d, Some(1), Utc::now()).unwrap();
        let sugar = store.global_volume("p1", 0).unwrap().unwrap();
        assert_eq!(sugar.state.current_volume_ul, 58_000.0);
        assert_eq!(sugar.state.total_dispensed_ul, 2000.0);
    }

    #[test]
    fn low_volume_alert_fires_at_threshold() {
        let store = Store::open_in_memory().unwrap();
        let tracker = VolumeTracker::new(&store);
        let cfg = config();
        let initial: BTreeMap<String, f64> = [("Sugar".to_string(), 3000.0)].into();
        tracker.initialize_global_tracking("p1", &cfg, &initial).unwrap();

        let d: BTreeMap<String, f64> = [("Sugar".to_string(), 1500.0)].into();
        let alerts = tracker
            .update_global_after_dispense("p1", &cfg, &d, None, Utc::now())
            .unwrap();
        assert!(matches!(alerts.as_slice(), [VolumeAlert::Low { remaining_ul, .. }] if *remaining_ul == 1500.0));
    }

    #[test]
    fn moves_are_clamped_and_shortages_reported() {
        let store = Store::open_in_memory().unwrap();
        let tracker = VolumeTracker::new(&store);
        let cfg = config();
        let sugar = cfg.pump_for_ingredient("Sugar").unwrap();
        let initial: BTreeMap<String, f64> = [("Sugar".to_string(), 500.0)].into();
        tracker.initialize_global_tracking("p1", &cfg, &initial).unwrap();

        let req: BTreeMap<String, f64> = [("Sugar".to_string(), 800.0)].into();
        let short = tracker.check_sufficient("p1", &cfg, &req).unwrap();
        assert_eq!(short.len(), 1);
        assert_eq!(short[0].available_ul, 500.0);

        let out = tracker.apply_global_move("p1", sugar, -2000.0, Utc::now()).unwrap();
        assert_eq!(out.after_ul, 0.0);
        let out = tracker.apply_global_move("p1", sugar, 90_000.0, Utc::now()).unwrap();
        assert_eq!(out.after_ul, 60_000.0);
    }

    #[test]
    fn unknown_ingredient_is_a_volume_error() {
        let store = Store::open_in_memory().unwrap();
        let tracker = VolumeTracker::new(&store);
        let d: BTreeMap<String, f64> = [("Citric".to_string(), 1.0)].into();
        assert!(matches!(
            tracker.update_volume_after_dispense("s1", &config(), &d, None, Utc::now()),
            Err(PumpError::Volume(_))
        ));
    }
}
