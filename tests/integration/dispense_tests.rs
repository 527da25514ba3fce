//! Dispense strategies end to end: store → service → pool → emulator.

use robotaste_pumps::app::events::{AppEvent, Strategy};
use robotaste_pumps::codec::{PumpStatus, VolumeUnit};
use robotaste_pumps::store::OperationStatus;

use crate::mock::{Rig, assert_close, recipe_of, sugar_and_water};

fn completed_strategy(rig: &Rig) -> Option<Strategy> {
    rig.sink.events.iter().find_map(|e| match e {
        AppEvent::DispenseCompleted { strategy, .. } => Some(*strategy),
        _ => None,
    })
}

// ── Sequential ────────────────────────────────────────────────

#[test]
fn sequential_waits_for_each_ingredient_in_turn() {
    let mut cfg = sugar_and_water();
    cfg.simultaneous_dispensing = false;
    let mut rig = Rig::new(cfg);
    let id = rig.enqueue(1, &[("Sugar", 250.0)]);

    assert!(rig.tick());

    let motion = rig.clock.motion_secs();
    assert_eq!(motion.len(), 2, "{motion:?}");
    assert_close(motion[0], 8.25);
    assert_close(motion[1], 321.75);

    let op = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(
        op.actual_volumes,
        Some(recipe_of(&[("Sugar", 250.0), ("Water", 9750.0)]))
    );
    assert_eq!(completed_strategy(&rig), Some(Strategy::Sequential));

    let sim = rig.sim();
    let sim = sim.lock();
    assert_close(sim.pump(0).unwrap().infused_ul, 250.0);
    assert_close(sim.pump(1).unwrap().infused_ul, 9750.0);
    assert_eq!(sim.pump(0).unwrap().status, PumpStatus::Stopped);
    assert_eq!(sim.pump(1).unwrap().status, PumpStatus::Stopped);
}

// ── Simultaneous ──────────────────────────────────────────────

#[test]
fn simultaneous_waits_once_for_the_slowest_pump() {
    let mut rig = Rig::new(sugar_and_water());
    let id = rig.enqueue(1, &[("Sugar", 250.0)]);

    assert!(rig.tick());

    let motion = rig.clock.motion_secs();
    assert_eq!(motion.len(), 1, "{motion:?}");
    assert_close(motion[0], 321.75);
    assert_eq!(completed_strategy(&rig), Some(Strategy::Simultaneous));
    assert_eq!(
        rig.store.get_dispense_operation(id).unwrap().unwrap().status,
        OperationStatus::Completed
    );

    let sim = rig.sim();
    let sim = sim.lock();
    assert_eq!(sim.pump(0).unwrap().runs, 1);
    assert_eq!(sim.pump(1).unwrap().runs, 1);
    assert_eq!(sim.pump(1).unwrap().status, PumpStatus::Stopped);
}

#[test]
fn failed_start_stops_pumps_already_running() {
    let mut rig = Rig::new(sugar_and_water());
    rig.sim().lock().reject_run(1, true);
    let id = rig.enqueue(1, &[("Sugar", 250.0)]);

    assert!(rig.tick());

    let op = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    let message = op.error_message.unwrap_or_default();
    assert!(message.contains("Water (pump 01)"), "{message}");

    // no motion wait happened, and Sugar was stopped again
    assert!(rig.clock.motion_secs().is_empty());
    let sim = rig.sim();
    let sim = sim.lock();
    assert_eq!(sim.pump(0).unwrap().runs, 1);
    assert_eq!(sim.pump(0).unwrap().status, PumpStatus::Stopped);
    assert!(matches!(
        rig.sink.events.last(),
        Some(AppEvent::DispenseFailed { operation_id, .. }) if *operation_id == id
    ));
}

// ── Burst ─────────────────────────────────────────────────────

#[test]
fn burst_sends_setup_once_per_session() {
    let mut cfg = sugar_and_water();
    cfg.use_burst_mode = true;
    let mut rig = Rig::new(cfg);
    rig.enqueue(1, &[("Sugar", 250.0)]);
    rig.enqueue(2, &[("Sugar", 500.0)]);

    assert!(rig.tick());
    assert!(rig.tick());

    let sim = rig.sim();
    let sim = sim.lock();
    let lines = sim.lines();
    let count = |needle: &str| lines.iter().filter(|l| l.as_str() == needle).count();
    assert_eq!(count("0 DIA 26.59 * 1 DIA 26.59 *"), 1);
    assert_eq!(count("0 RAT 2000 UM * 1 RAT 2000 UM *"), 1);
    assert_eq!(count("0 VOL 0.250 * 1 VOL 9.750 *"), 1);
    assert_eq!(count("0 VOL 0.500 * 1 VOL 9.500 *"), 1);
    assert_eq!(count("0 RUN * 1 RUN *"), 2);

    assert_close(sim.pump(0).unwrap().infused_ul, 750.0);
    assert_close(sim.pump(1).unwrap().infused_ul, 19_250.0);
    assert_eq!(sim.pump(0).unwrap().status, PumpStatus::Stopped);

    let motion = rig.clock.motion_secs();
    assert_eq!(motion.len(), 2);
    assert_close(motion[0], 321.75);
    assert_eq!(completed_strategy(&rig), Some(Strategy::Burst));
}

#[test]
fn rate_beyond_syringe_limit_fails_the_operation() {
    let mut cfg = sugar_and_water();
    cfg.use_burst_mode = true;
    cfg.dispensing_rate_ul_min = 50_000.0;
    let mut rig = Rig::new(cfg);
    let id = rig.enqueue(1, &[("Sugar", 250.0)]);

    assert!(rig.tick());

    let op = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
}

// ── Dual syringe ──────────────────────────────────────────────

#[test]
fn dual_syringe_commands_half_and_tracks_double_capacity() {
    let mut cfg = sugar_and_water();
    cfg.total_volume_ml = None;
    cfg.pumps[0].dual_syringe = true;
    cfg.pumps[0].volume_unit = VolumeUnit::Ul;
    let mut rig = Rig::new(cfg);
    rig.enqueue(1, &[("Sugar", 10_000.0)]);

    assert!(rig.tick());

    {
        let sim = rig.sim();
        let sim = sim.lock();
        let sugar = sim.pump(0).unwrap();
        assert_eq!(sugar.volume_unit, VolumeUnit::Ul);
        assert_close(sugar.infused_ul, 5000.0);
        assert!(sim.lines().iter().any(|l| l == "00VOL 5000"));
    }

    let sugar = rig.store.session_volume("s1", "Sugar").unwrap().unwrap();
    assert_close(sugar.state.max_capacity_ul, 120_000.0);
    assert_close(sugar.state.current_volume_ul, 110_000.0);
}

// ── Failures before any bus traffic ───────────────────────────

#[test]
fn unknown_ingredient_fails_without_touching_the_bus() {
    let mut rig = Rig::new(sugar_and_water());
    let id = rig.enqueue(1, &[("Umami", 100.0), ("Salt", 100.0)]);

    assert!(rig.tick());

    let op = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(
        op.error_message.as_deref(),
        Some("no pump configured for ingredient 'Salt'; no pump configured for ingredient 'Umami'")
    );
    assert!(rig.sim().lock().lines().is_empty());
}

#[test]
fn unreachable_pump_fails_initialisation() {
    let mut rig = Rig::new(sugar_and_water());
    rig.sim().lock().set_offline(1, true);
    let id = rig.enqueue(1, &[("Sugar", 250.0)]);

    assert!(rig.tick());

    let op = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(!rig.pool.contains("s1"));
    assert_eq!(rig.sim().lock().pump(0).map_or(0, |p| p.runs), 0);
}

#[test]
fn pumps_are_reused_across_cycles() {
    let mut rig = Rig::new(sugar_and_water());
    rig.enqueue(1, &[("Sugar", 250.0)]);
    rig.enqueue(2, &[("Sugar", 300.0)]);

    assert!(rig.tick());
    let diameter_writes = |rig: &Rig| {
        rig.sim()
            .lock()
            .lines()
            .iter()
            .filter(|l| l.starts_with("00DIA 26"))
            .count()
    };
    let after_first = diameter_writes(&rig);
    assert!(rig.tick());
    assert_eq!(diameter_writes(&rig), after_first);
    assert_eq!(rig.pool.session_count(), 1);
}
