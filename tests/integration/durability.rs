//! Durability tests against the SQLite backend.
//!
//! Reopening the database file simulates the process being killed.

use crate::common::{Rig, daily, hm, utc};
use dosewatch::{
    BootRecovery, Clock, OccurrenceStatus, RecoveryTrigger, RecurrenceRule, ReminderDefinition,
    ReminderStore, SqliteStorage,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Test: Reminders and occurrence history survive a reopen and recovery
/// arms from the persisted state.
#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dosewatch.db");

    let (aspirin, first_id) = {
        let store = Arc::new(SqliteStorage::new(&path).await.unwrap());
        let rig = Rig::new(store.clone(), utc(2024, 5, 1, 7, 0));
        let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
        rig.engine.save_reminder(aspirin.clone()).await.unwrap();
        rig.run_until(utc(2024, 5, 1, 9, 0)).await;
        let first = rig.store.list_occurrences(&aspirin.id).await.unwrap()[0].clone();
        store.close().await;
        (aspirin, first.id)
    };

    let store = Arc::new(SqliteStorage::new(&path).await.unwrap());
    let rig = Rig::new(store, utc(2024, 5, 1, 20, 0));
    let stored = rig.store.get_reminder(&aspirin.id).await.unwrap().unwrap();
    assert_eq!(stored, aspirin);

    let report = BootRecovery::new(rig.engine.clone())
        .recover()
        .await
        .into_report()
        .await
        .unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.rearmed, 1);

    let history = rig.store.list_occurrences(&aspirin.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first_id);
    assert_eq!(history[0].status, OccurrenceStatus::Delivered);
    assert_eq!(history[1].status, OccurrenceStatus::Armed);
    assert_eq!(history[1].fire_at, utc(2024, 5, 2, 8, 0));
    assert_eq!(rig.timer.armed(), vec![(history[1].id, utc(2024, 5, 2, 8, 0))]);
}

/// Test: A deleted reminder stays deleted after reopen, history kept.
#[tokio::test]
async fn test_delete_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dosewatch.db");

    let aspirin = {
        let store = Arc::new(SqliteStorage::new(&path).await.unwrap());
        let rig = Rig::new(store.clone(), utc(2024, 5, 1, 7, 0));
        let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
        rig.engine.save_reminder(aspirin.clone()).await.unwrap();
        rig.engine.delete_reminder(&aspirin.id).await.unwrap();
        store.close().await;
        aspirin
    };

    let store = Arc::new(SqliteStorage::new(&path).await.unwrap());
    let rig = Rig::new(store, utc(2024, 5, 1, 7, 30));
    assert!(rig.store.get_reminder(&aspirin.id).await.unwrap().is_none());

    let report = rig.engine.reconcile_all().await;
    assert_eq!(report.examined, 0);
    let history = rig.store.list_occurrences(&aspirin.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, OccurrenceStatus::Cancelled);
}

/// Test: Fire-times with sub-millisecond precision are kept across passes
/// instead of being cancelled and re-created every time.
#[tokio::test]
async fn test_sub_millisecond_fire_times_are_stable() {
    let store = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let rig = Rig::new(store, utc(2024, 5, 1, 7, 0));
    let precise = utc(2024, 5, 1, 10, 0) + chrono::Duration::nanoseconds(123_456);
    let once = ReminderDefinition::new("Antibiotic", "last dose", RecurrenceRule::once(precise))
        .with_created_at(rig.clock.now());
    let interval = ReminderDefinition::new(
        "Ibuprofen",
        "400mg",
        RecurrenceRule::interval(rig.clock.now() + chrono::Duration::nanoseconds(987_654), 6)
            .unwrap(),
    )
    .with_created_at(rig.clock.now());
    rig.engine.save_reminder(once.clone()).await.unwrap();
    rig.engine.save_reminder(interval.clone()).await.unwrap();

    for _ in 0..3 {
        let report = rig.engine.reconcile_all().await;
        assert_eq!(report.rearmed, 2);
        assert_eq!(report.armed, 0);
        assert_eq!(report.cancelled, 0);
    }

    for id in [once.id, interval.id] {
        let history = rig.store.list_occurrences(&id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OccurrenceStatus::Armed);
    }
    assert_eq!(
        rig.store.list_occurrences(&once.id).await.unwrap()[0].fire_at,
        precise
    );
    assert!(rig.timer.cancelled().is_empty());
}
