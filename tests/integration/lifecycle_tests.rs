//! Operation lifecycle through the service loop: claim order, terminal
//! states, stale rows and the event stream.

use robotaste_pumps::app::events::{AppEvent, OperationKind};
use robotaste_pumps::config::ServiceConfig;
use robotaste_pumps::store::OperationStatus;

use crate::mock::{Rig, SESSION, recipe_of, sugar_and_water};

#[test]
fn pending_goes_through_in_progress_to_completed() {
    let mut rig = Rig::new(sugar_and_water());
    let id = rig.enqueue(1, &[("Sugar", 250.0)]);

    let pending = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(pending.status, OperationStatus::Pending);
    assert!(pending.started_at.is_none());

    assert!(rig.tick());

    let done = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(done.status, OperationStatus::Completed);
    let started = done.started_at.expect("claim stamps started_at");
    let completed = done.completed_at.expect("completion stamps completed_at");
    assert!(completed >= started);
    assert!(done.error_message.is_none());

    assert!(matches!(
        rig.sink.events.first(),
        Some(AppEvent::Claimed { kind: OperationKind::Dispense, operation_id }) if *operation_id == id
    ));
    assert_eq!(rig.service.completed_count(), 1);
}

#[test]
fn operations_are_claimed_oldest_first() {
    let mut rig = Rig::new(sugar_and_water());
    let first = rig.enqueue(1, &[("Sugar", 100.0)]);
    let second = rig.enqueue(2, &[("Sugar", 200.0)]);

    assert!(rig.tick());
    assert_eq!(
        rig.store.get_dispense_operation(first).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    assert_eq!(
        rig.store.get_dispense_operation(second).unwrap().unwrap().status,
        OperationStatus::Pending
    );
    assert!(rig.tick());
    assert!(!rig.tick(), "queue should be empty");
}

#[test]
fn unknown_session_fails_and_loop_continues() {
    let mut rig = Rig::new(sugar_and_water());
    let orphan = rig
        .store
        .enqueue_dispense("nobody", 1, None, &recipe_of(&[("Sugar", 10.0)]))
        .unwrap();
    let good = rig.enqueue(1, &[("Sugar", 10.0)]);

    assert!(rig.tick());
    assert!(rig.tick());

    let orphan = rig.store.get_dispense_operation(orphan).unwrap().unwrap();
    assert_eq!(orphan.status, OperationStatus::Failed);
    assert!(orphan.error_message.unwrap_or_default().contains("nobody"));
    assert_eq!(
        rig.store.get_dispense_operation(good).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    assert_eq!(rig.service.failed_count(), 1);
}

#[test]
fn disabled_pumps_fail_the_operation() {
    let mut cfg = sugar_and_water();
    cfg.enabled = false;
    let mut rig = Rig::new(cfg);
    let id = rig.enqueue(1, &[("Sugar", 10.0)]);

    assert!(rig.tick());
    let op = rig.store.get_dispense_operation(id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.error_message.unwrap_or_default().contains("disabled"));
}

#[test]
fn stale_in_progress_rows_are_reported_not_reclaimed() {
    let mut rig = Rig::new(sugar_and_water());
    let id = rig.enqueue(1, &[("Sugar", 10.0)]);
    // simulate a crash mid-dispense
    assert_eq!(rig.store.claim_next_dispense().unwrap().map(|op| op.id), Some(id));

    rig.service.startup(&rig.store, &mut rig.sink).unwrap();
    assert!(rig.sink.events.iter().any(|e| matches!(
        e,
        AppEvent::StaleOperation { kind: OperationKind::Dispense, operation_id } if *operation_id == id
    )));

    assert!(!rig.tick());
    assert_eq!(
        rig.store.get_dispense_operation(id).unwrap().unwrap().status,
        OperationStatus::InProgress
    );
}

#[test]
fn startup_prunes_history_when_retention_is_set() {
    let service_config = ServiceConfig {
        history_retention_days: Some(7),
        ..ServiceConfig::default()
    };
    let mut rig = Rig::with_service(sugar_and_water(), service_config);
    rig.enqueue(1, &[("Sugar", 10.0)]);
    assert!(rig.tick());

    rig.service.startup(&rig.store, &mut rig.sink).unwrap();
    assert!(rig
        .sink
        .events
        .iter()
        .any(|e| matches!(e, AppEvent::HistoryPruned { rows: 0 })));
    assert!(!rig.store.session_volume_history(SESSION, 10).unwrap().is_empty());
}

#[test]
fn shutdown_releases_every_pump() {
    let mut rig = Rig::new(sugar_and_water());
    rig.enqueue(1, &[("Sugar", 10.0)]);
    assert!(rig.tick());
    assert_eq!(rig.pool.session_count(), 1);

    rig.service.shutdown(&mut rig.pool, &mut rig.sink);
    assert_eq!(rig.pool.session_count(), 0);
    assert!(matches!(rig.sink.events.last(), Some(AppEvent::Stopped)));
}
