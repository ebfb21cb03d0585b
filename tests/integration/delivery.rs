//! Delivery integration tests.
//!
//! Fire callbacks are at-least-once: they can be late, duplicated or arrive
//! after reconciliation already gave up on an occurrence.

use crate::common::{Rig, daily, hm, init_tracing, utc};
use dosewatch::testing::RecordingPresenter;
use dosewatch::{
    Clock, DeliveryHandler, DeliveryOutcome, InMemoryStorage, OccurrenceStatus, RecurrenceRule,
    ReminderDefinition, ReminderStore, SchedulingEngine, TokioFireTimer, spawn_callback_loop,
};
use std::sync::Arc;
use std::time::Duration;

/// Test: Many copies of the same callback at once deliver exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_callbacks_present_once() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(aspirin.clone()).await.unwrap();
    let armed = rig.store.latest_occurrence(&aspirin.id).await.unwrap().unwrap();
    rig.clock.set(armed.fire_at);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let handler = rig.handler.clone();
        let id = armed.id;
        handles.push(tokio::spawn(async move { handler.on_fire(id).await.unwrap() }));
    }
    let mut delivered = 0;
    for handle in handles {
        match handle.await.unwrap() {
            DeliveryOutcome::Delivered { .. } => delivered += 1,
            DeliveryOutcome::Duplicate => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(delivered, 1);
    assert_eq!(rig.presenter.for_reminder(&aspirin.id).len(), 1);
    // The delivered occurrence plus exactly one successor.
    let history = rig.store.list_occurrences(&aspirin.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(rig.open_occurrences(&aspirin.id).await.len(), 1);
}

/// Test: A callback that shows up after reconciliation marked the occurrence
/// Missed does not present it.
#[tokio::test]
async fn test_stale_callback_after_missed_is_superseded() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(aspirin.clone()).await.unwrap();
    let first = rig.store.latest_occurrence(&aspirin.id).await.unwrap().unwrap();

    rig.clock.set(utc(2024, 5, 1, 12, 0));
    rig.engine.reconcile_all().await;

    let outcome = rig.handler.on_fire(first.id).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Superseded);
    assert!(rig.presenter.presentations().is_empty());
    assert_eq!(rig.open_occurrences(&aspirin.id).await.len(), 1);
}

/// Test: A callback for a deleted reminder's occurrence is a no-op.
#[tokio::test]
async fn test_callback_after_delete_is_duplicate() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(aspirin.clone()).await.unwrap();
    let armed = rig.store.latest_occurrence(&aspirin.id).await.unwrap().unwrap();

    rig.engine.delete_reminder(&aspirin.id).await.unwrap();
    rig.clock.set(armed.fire_at);
    let outcome = rig.handler.on_fire(armed.id).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Duplicate);
    assert!(rig.presenter.presentations().is_empty());
}

/// Test: A failing presenter does not roll back the delivery.
#[tokio::test]
async fn test_presenter_failure_keeps_delivered_state() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(aspirin.clone()).await.unwrap();
    let armed = rig.store.latest_occurrence(&aspirin.id).await.unwrap().unwrap();

    rig.presenter.set_failing(true);
    rig.clock.set(armed.fire_at);
    let outcome = rig.handler.on_fire(armed.id).await.unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Delivered { .. }));

    let stored = rig.store.get_occurrence(&armed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OccurrenceStatus::Delivered);
    assert_eq!(rig.open_occurrences(&aspirin.id).await.len(), 1);
}

/// Test: Real tokio timer drives delivery through the callback loop.
#[tokio::test]
async fn test_tokio_timer_callback_loop_delivers_one_shot() {
    init_tracing();
    let store = Arc::new(InMemoryStorage::new());
    let (timer, callbacks) = TokioFireTimer::new();
    let timer = Arc::new(timer);
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = SchedulingEngine::new(store.clone(), timer.clone(), presenter.clone());
    let loop_handle = spawn_callback_loop(DeliveryHandler::new(engine.clone()), callbacks);

    let at = chrono::Utc::now() + chrono::Duration::milliseconds(200);
    let dose = ReminderDefinition::new("Antibiotic", "final dose", RecurrenceRule::once(at));
    engine.save_reminder(dose.clone()).await.unwrap();
    assert_eq!(timer.armed_count(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while presenter.presentations().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "reminder was not presented in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Give the handler a moment to finish deactivating.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stored = store.get_reminder(&dose.id).await.unwrap().unwrap();
        if !stored.active {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "one-shot stayed active");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let presented = presenter.presentations();
    assert_eq!(presented.len(), 1);
    assert!(!presented[0].late);
    assert_eq!(timer.armed_count(), 0);
    loop_handle.abort();
}

/// Test: Permission revoked on the real timer, then restored.
#[tokio::test]
async fn test_tokio_timer_permission_round_trip() {
    let store = Arc::new(InMemoryStorage::new());
    let (timer, _callbacks) = TokioFireTimer::new();
    let timer = Arc::new(timer);
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = SchedulingEngine::new(store.clone(), timer.clone(), presenter.clone());

    timer.set_permission(false);
    let dose = ReminderDefinition::new(
        "Insulin",
        "10 units",
        RecurrenceRule::interval(chrono::Utc::now() + chrono::Duration::hours(1), 12).unwrap(),
    );
    let report = engine.save_reminder(dose.clone()).await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(timer.armed_count(), 0);
    assert!(presenter.presentations()[0].late);

    timer.set_permission(true);
    let report = engine.reconcile_all().await;
    assert_eq!(report.rearmed, 1);
    assert_eq!(timer.armed_count(), 1);
}
