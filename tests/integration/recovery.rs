//! Recovery scenario integration tests.
//!
//! Tests that verify every active reminder ends up with exactly one armed
//! occurrence after a reboot, a crash or a cold start, without replaying a
//! backlog of elapsed doses.

use crate::common::{Rig, daily, hm, utc};
use dosewatch::testing::FlakyStore;
use dosewatch::{
    BootRecovery, Clock, ColdStartRecovery, InMemoryStorage, OccurrenceStatus, RecoveryTrigger,
    ReminderStore, RetryPolicy,
};
use std::sync::Arc;

/// Test: Aspirin daily 08:00 created on day 0, device rebooted on day 3
/// before 08:00.
#[tokio::test]
async fn test_reboot_on_day_three_arms_same_day_without_backlog() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(aspirin.clone()).await.unwrap();

    // Powered off until day 3, 06:00.
    rig.clock.set(utc(2024, 5, 4, 6, 0));
    let rebooted = rig.restart();
    let outcome = BootRecovery::new(rebooted.engine.clone())
        .handle_broadcast("android.intent.action.BOOT_COMPLETED")
        .await
        .unwrap();
    let report = outcome.into_report().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.missed, 1);
    assert_eq!(report.armed, 1);

    let open = rebooted.open_occurrences(&aspirin.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, OccurrenceStatus::Armed);
    assert_eq!(open[0].fire_at, utc(2024, 5, 4, 8, 0));
    assert_eq!(rebooted.timer.armed(), vec![(open[0].id, utc(2024, 5, 4, 8, 0))]);

    // Nothing elapsed was replayed.
    assert!(rig.presenter.presentations().is_empty());
    assert_eq!(
        rebooted.store.list_occurrences(&aspirin.id).await.unwrap().len(),
        2
    );
}

/// Test: Same reboot, but after that day's 08:00 has passed.
#[tokio::test]
async fn test_reboot_after_fire_time_arms_next_day() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(aspirin.clone()).await.unwrap();

    rig.clock.set(utc(2024, 5, 4, 9, 30));
    let rebooted = rig.restart();
    BootRecovery::new(rebooted.engine.clone())
        .recover()
        .await
        .into_report()
        .await
        .unwrap();

    let open = rebooted.open_occurrences(&aspirin.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].fire_at, utc(2024, 5, 5, 8, 0));
    assert!(rig.presenter.presentations().is_empty());
}

/// Test: Restart shortly after a fire-time delivers that dose late, once.
#[tokio::test]
async fn test_cold_start_within_grace_delivers_late_once() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(aspirin.clone()).await.unwrap();
    let first = rig.store.latest_occurrence(&aspirin.id).await.unwrap().unwrap();

    // Process died before the callback; app opened at 08:04.
    rig.clock.set(utc(2024, 5, 1, 8, 4));
    let restarted = rig.restart();
    let trigger = ColdStartRecovery::new(restarted.engine.clone());
    let report = trigger.recover().await.into_report().await.unwrap();
    assert_eq!(report.delivered_late, 1);

    // Opening the app again changes nothing.
    let again = trigger.recover().await.into_report().await.unwrap();
    assert_eq!(again.delivered_late, 0);
    assert_eq!(again.rearmed, 1);

    let shown = rig.presenter.for_reminder(&aspirin.id);
    assert_eq!(shown.len(), 1);
    assert!(shown[0].late);
    assert_eq!(shown[0].occurrence_id, first.id);

    let delivered = restarted.store.get_occurrence(&first.id).await.unwrap().unwrap();
    assert_eq!(delivered.status, OccurrenceStatus::Delivered);
    assert!(delivered.delivered_late);
}

/// Test: A pass that dies halfway and is re-run ends in the same state as
/// a clean pass.
#[tokio::test]
async fn test_interrupted_pass_is_restartable() {
    let inner = Arc::new(InMemoryStorage::new());
    let mut ids = Vec::new();
    for i in 0..6 {
        let def = daily(&format!("Med {}", i), hm(8 + i, 0), utc(2024, 5, 1, 0, 0));
        ids.push(def.id);
        inner.put_reminder(def).await.unwrap();
    }
    let flaky = Arc::new(FlakyStore::new(inner.clone()));
    let rig = Rig::new(flaky.clone(), utc(2024, 5, 1, 7, 0));
    let engine = rig
        .engine
        .clone()
        .with_retry_policy(RetryPolicy::none())
        .with_max_parallel_reconciles(1);

    // Crash partway through: every call after the tenth fails.
    flaky.fail_after(10);
    let crashed = engine.reconcile_all().await;
    assert!(!crashed.is_clean());

    flaky.heal();
    let rerun = engine.reconcile_all().await;
    assert!(rerun.is_clean());
    let settled = engine.reconcile_all().await;
    assert_eq!(settled.armed, 0);
    assert_eq!(settled.rearmed, 6);

    for id in &ids {
        let open = rig.open_occurrences(id).await;
        assert_eq!(open.len(), 1, "reminder {} should have one open occurrence", id);
        assert_eq!(open[0].status, OccurrenceStatus::Armed);
        assert!(rig.timer.is_armed(&open[0].id));
    }
    assert_eq!(rig.timer.armed().len(), 6);
}

/// Test: Inactive reminders are not armed by recovery.
#[tokio::test]
async fn test_recovery_skips_inactive_reminders() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let active = daily("Aspirin", hm(8, 0), rig.clock.now());
    let paused = daily("Iron", hm(9, 0), rig.clock.now()).with_active(false);
    rig.store.put_reminder(active.clone()).await.unwrap();
    rig.store.put_reminder(paused.clone()).await.unwrap();

    let report = ColdStartRecovery::new(rig.engine.clone())
        .recover()
        .await
        .into_report()
        .await
        .unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(rig.open_occurrences(&active.id).await.len(), 1);
    assert!(rig.open_occurrences(&paused.id).await.is_empty());
}
