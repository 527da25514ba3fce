//! Refill operations: single-pump moves and the protocol-wide ledger.

use std::collections::BTreeMap;

use robotaste_pumps::app::events::AppEvent;
use robotaste_pumps::codec::{Direction, VolumeUnit};
use robotaste_pumps::store::{OperationStatus, RefillType};
use robotaste_pumps::volume::VolumeTracker;

use crate::mock::{PROTOCOL, Rig, assert_close, recipe_of, sugar_and_water};

fn seed_global(rig: &Rig, sugar_ul: f64) {
    VolumeTracker::new(&rig.store)
        .initialize_global_tracking(PROTOCOL, &rig.config, &recipe_of(&[("Sugar", sugar_ul)]))
        .unwrap();
}

#[test]
fn withdraw_fills_the_global_ledger() {
    let mut rig = Rig::new(sugar_and_water());
    seed_global(&rig, 10_000.0);
    let id = rig
        .store
        .enqueue_refill(PROTOCOL, 0, RefillType::Withdraw, 5000.0, None, Some("Sugar"))
        .unwrap();

    assert!(rig.tick());

    let op = rig.store.get_refill_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.direction, Direction::Withdraw);

    let sugar = rig.store.global_volume(PROTOCOL, 0).unwrap().unwrap();
    assert_close(sugar.state.current_volume_ul, 15_000.0);

    let sim = rig.sim();
    let sim = sim.lock();
    assert_close(sim.pump(0).unwrap().withdrawn_ul, 5000.0);
    // diameter re-sent before the move
    assert!(sim.lines().iter().any(|l| l == "00DIA 26.59"));
    drop(sim);

    // refill pumps are not kept around
    assert_eq!(rig.pool.session_count(), 0);
    assert!(rig.sink.events.iter().any(|e| matches!(
        e,
        AppEvent::RefillCompleted { withdraw: true, pump_address: 0, .. }
    )));
    // 5 mL at 2000 uL/min, plus the buffer
    assert_close(rig.clock.motion_secs()[0], 165.0);
}

#[test]
fn purge_empties_and_clamps_at_zero() {
    let mut rig = Rig::new(sugar_and_water());
    seed_global(&rig, 1000.0);
    rig.store
        .enqueue_refill(PROTOCOL, 0, RefillType::Purge, 3000.0, None, None)
        .unwrap();

    assert!(rig.tick());

    let sugar = rig.store.global_volume(PROTOCOL, 0).unwrap().unwrap();
    assert_close(sugar.state.current_volume_ul, 0.0);
    assert_close(rig.sim().lock().pump(0).unwrap().infused_ul, 3000.0);
}

#[test]
fn dispenses_outrank_refills() {
    let mut rig = Rig::new(sugar_and_water());
    let refill = rig
        .store
        .enqueue_refill(PROTOCOL, 0, RefillType::Withdraw, 1000.0, None, None)
        .unwrap();
    let dispense = rig.enqueue(1, &[("Sugar", 100.0)]);

    assert!(rig.tick());
    assert_eq!(
        rig.store.get_dispense_operation(dispense).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    assert_eq!(
        rig.store.get_refill_operation(refill).unwrap().unwrap().status,
        OperationStatus::Pending
    );
    assert!(rig.tick());
    assert_eq!(
        rig.store.get_refill_operation(refill).unwrap().unwrap().status,
        OperationStatus::Completed
    );
}

#[test]
fn refill_for_unknown_address_fails() {
    let mut rig = Rig::new(sugar_and_water());
    let id = rig
        .store
        .enqueue_refill(PROTOCOL, 7, RefillType::Withdraw, 1000.0, None, None)
        .unwrap();

    assert!(rig.tick());

    let op = rig.store.get_refill_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.error_message.unwrap_or_default().contains("address 07"));
    assert!(rig.sim().lock().lines().is_empty());
}

#[test]
fn dual_syringe_refill_moves_half_per_syringe() {
    let mut cfg = sugar_and_water();
    cfg.pumps[0].dual_syringe = true;
    let mut rig = Rig::new(cfg);
    VolumeTracker::new(&rig.store)
        .initialize_global_tracking(PROTOCOL, &rig.config, &BTreeMap::new())
        .unwrap();
    rig.store
        .enqueue_refill(PROTOCOL, 0, RefillType::Purge, 4000.0, None, None)
        .unwrap();

    assert!(rig.tick());

    assert_close(rig.sim().lock().pump(0).unwrap().infused_ul, 2000.0);
    let sugar = rig.store.global_volume(PROTOCOL, 0).unwrap().unwrap();
    assert_close(sugar.state.current_volume_ul, 116_000.0);
}

// ── Refill between dispenses ──────────────────────────────────

#[test]
fn burst_after_withdraw_refill_infuses_again() {
    let mut cfg = sugar_and_water();
    cfg.use_burst_mode = true;
    let mut rig = Rig::new(cfg);
    seed_global(&rig, 10_000.0);

    rig.enqueue(1, &[("Sugar", 250.0)]);
    assert!(rig.tick());
    rig.store
        .enqueue_refill(PROTOCOL, 0, RefillType::Withdraw, 1000.0, None, Some("Sugar"))
        .unwrap();
    assert!(rig.tick());
    rig.enqueue(2, &[("Sugar", 500.0)]);
    assert!(rig.tick());

    let sim = rig.sim();
    let sim = sim.lock();
    let sugar = sim.pump(0).unwrap();
    assert_close(sugar.infused_ul, 750.0);
    assert_close(sugar.withdrawn_ul, 1000.0);
    assert_eq!(sugar.direction, Direction::Infuse);
    // the refill voided the first setup
    let setups = sim
        .lines()
        .iter()
        .filter(|l| l.as_str() == "0 DIA 26.59 * 1 DIA 26.59 *")
        .count();
    assert_eq!(setups, 2);
    assert_eq!(rig.pool.session_count(), 1);
}

#[test]
fn burst_setup_covers_pumps_idle_in_the_first_cycle() {
    let mut cfg = sugar_and_water();
    cfg.use_burst_mode = true;
    cfg.pumps[0].volume_unit = VolumeUnit::Ul;
    let mut rig = Rig::new(cfg);

    rig.enqueue(1, &[("Sugar", 0.0)]);
    assert!(rig.tick());
    assert_close(rig.sim().lock().pump(1).unwrap().infused_ul, 10_000.0);
    rig.enqueue(2, &[("Sugar", 250.0)]);
    assert!(rig.tick());

    let sim = rig.sim();
    let sim = sim.lock();
    let sugar = sim.pump(0).unwrap();
    assert_eq!(sugar.volume_unit, VolumeUnit::Ul);
    assert_close(sugar.infused_ul, 250.0);
}

#[test]
fn ul_pump_dispenses_in_ul_after_a_large_refill() {
    let mut cfg = sugar_and_water();
    cfg.pumps[0].volume_unit = VolumeUnit::Ul;
    let mut rig = Rig::new(cfg);
    seed_global(&rig, 10_000.0);

    rig.enqueue(1, &[("Sugar", 250.0)]);
    assert!(rig.tick());
    // too wide for a UL field, so the refill programs the pump in ML
    rig.store
        .enqueue_refill(PROTOCOL, 0, RefillType::Withdraw, 20_000.0, None, Some("Sugar"))
        .unwrap();
    assert!(rig.tick());
    assert_eq!(rig.sim().lock().pump(0).unwrap().volume_unit, VolumeUnit::Ml);
    let id = rig.enqueue(2, &[("Sugar", 250.0)]);
    assert!(rig.tick());

    assert_eq!(
        rig.store.get_dispense_operation(id).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    let sim = rig.sim();
    let sim = sim.lock();
    let sugar = sim.pump(0).unwrap();
    assert_eq!(sugar.volume_unit, VolumeUnit::Ul);
    assert_close(sugar.infused_ul, 500.0);
    assert_close(sugar.withdrawn_ul, 20_000.0);
}
