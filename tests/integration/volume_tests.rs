//! Volume tracking driven by real dispenses: both ledgers, alerts and the
//! insufficient-volume interlock.

use chrono::Utc;

use robotaste_pumps::app::events::{AppEvent, VolumeScope};
use robotaste_pumps::config::ServiceConfig;
use robotaste_pumps::store::{HistoryEventType, OperationStatus};
use robotaste_pumps::volume::VolumeTracker;

use crate::mock::{PROTOCOL, Rig, SESSION, assert_close, recipe_of, sugar_and_water};

#[test]
fn dispense_updates_session_and_global_ledgers() {
    let mut rig = Rig::new(sugar_and_water());
    rig.enqueue(3, &[("Sugar", 250.0)]);

    assert!(rig.tick());

    let sugar = rig.store.session_volume(SESSION, "Sugar").unwrap().unwrap();
    assert_close(sugar.state.current_volume_ul, 59_750.0);
    assert_close(sugar.state.total_dispensed_ul, 250.0);
    let water = rig.store.global_volume(PROTOCOL, 1).unwrap().unwrap();
    assert_close(water.state.current_volume_ul, 50_250.0);

    let history = rig.store.session_volume_history(SESSION, 10).unwrap();
    let dispense = history
        .iter()
        .find(|h| h.entry.event_type == HistoryEventType::Dispense && h.entry.ingredient == "Sugar")
        .unwrap();
    assert_close(dispense.entry.volume_before_ul, 60_000.0);
    assert_close(dispense.entry.volume_after_ul, 59_750.0);
    assert_eq!(dispense.entry.cycle_number, Some(3));
}

#[test]
fn global_volume_carries_across_sessions() {
    let mut rig = Rig::new(sugar_and_water());
    rig.store.register_session("s2", PROTOCOL).unwrap();
    rig.enqueue(1, &[("Sugar", 1000.0)]);
    rig.store
        .enqueue_dispense("s2", 1, None, &recipe_of(&[("Sugar", 1000.0)]))
        .unwrap();

    assert!(rig.tick());
    assert!(rig.tick());

    let global = rig.store.global_volume(PROTOCOL, 0).unwrap().unwrap();
    assert_close(global.state.current_volume_ul, 58_000.0);
    let s2 = rig.store.session_volume("s2", "Sugar").unwrap().unwrap();
    assert_close(s2.state.current_volume_ul, 59_000.0);
}

#[test]
fn low_volume_raises_an_alert() {
    let mut rig = Rig::new(sugar_and_water());
    VolumeTracker::new(&rig.store)
        .initialize_volume_tracking(SESSION, &rig.config, &recipe_of(&[("Sugar", 2100.0)]))
        .unwrap();
    rig.enqueue(1, &[("Sugar", 250.0)]);

    assert!(rig.tick());

    assert!(rig.sink.events.iter().any(|e| matches!(
        e,
        AppEvent::VolumeLow { scope: VolumeScope::Session(s), pump_address: 0, remaining_ul, .. }
            if s == SESSION && (*remaining_ul - 1850.0).abs() < 1e-6
    )));
}

#[test]
fn running_dry_is_reported_and_clamped() {
    let mut rig = Rig::new(sugar_and_water());
    VolumeTracker::new(&rig.store)
        .initialize_volume_tracking(SESSION, &rig.config, &recipe_of(&[("Sugar", 100.0)]))
        .unwrap();
    rig.enqueue(1, &[("Sugar", 150.0)]);

    assert!(rig.tick());

    let sugar = rig.store.session_volume(SESSION, "Sugar").unwrap().unwrap();
    assert_close(sugar.state.current_volume_ul, 0.0);
    assert!(rig.sink.events.iter().any(|e| matches!(
        e,
        AppEvent::RanEmpty { scope: VolumeScope::Session(_), pump_address: 0, .. }
    )));
}

#[test]
fn interlock_blocks_dispense_before_any_bus_traffic() {
    let service_config = ServiceConfig {
        block_on_insufficient_volume: true,
        ..ServiceConfig::default()
    };
    let mut rig = Rig::with_service(sugar_and_water(), service_config);
    VolumeTracker::new(&rig.store)
        .initialize_global_tracking(PROTOCOL, &rig.config, &recipe_of(&[("Sugar", 100.0)]))
        .unwrap();
    let id = rig.enqueue(1, &[("Sugar", 250.0)]);

    assert!(rig.tick());

    let op = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.error_message.unwrap_or_default().contains("insufficient Sugar"));
    assert!(rig.sim().lock().lines().is_empty());
}

#[test]
fn session_refill_records_the_delta() {
    let rig = Rig::new(sugar_and_water());
    let tracker = VolumeTracker::new(&rig.store);
    tracker
        .initialize_volume_tracking(SESSION, &rig.config, &recipe_of(&[("Sugar", 10_000.0)]))
        .unwrap();
    let sugar = rig.config.pumps[0].clone();

    let outcome = tracker
        .record_refill_for_session(SESSION, &sugar, 45_000.0, Utc::now())
        .unwrap();
    assert_close(outcome.before_ul, 10_000.0);
    assert_close(outcome.after_ul, 45_000.0);
    assert_close(outcome.delta_ul, 35_000.0);

    let state = rig.store.session_volume(SESSION, "Sugar").unwrap().unwrap();
    assert_close(state.state.current_volume_ul, 45_000.0);
    assert!(state.state.last_refilled_at.is_some());

    let history = rig.store.session_volume_history(SESSION, 10).unwrap();
    let refill = history
        .iter()
        .find(|h| h.entry.event_type == HistoryEventType::Refill)
        .unwrap();
    assert_eq!(refill.entry.ingredient, "Sugar");
    assert_close(refill.entry.volume_before_ul, 10_000.0);
    assert_close(refill.entry.volume_after_ul, 45_000.0);
    assert_close(refill.entry.volume_change_ul, 35_000.0);

    // beyond the syringe: rejected, ledger untouched
    assert!(
        tracker
            .record_refill_for_session(SESSION, &sugar, 70_000.0, Utc::now())
            .is_err()
    );
    let state = rig.store.session_volume(SESSION, "Sugar").unwrap().unwrap();
    assert_close(state.state.current_volume_ul, 45_000.0);
}
