//! Concurrency integration tests.
//!
//! Recovery triggers, edits and fire callbacks can all run at the same time;
//! the per-reminder lock keeps each reminder at one open occurrence.

use crate::common::{Rig, daily, hm, utc};
use dosewatch::{
    BootRecovery, Clock, ColdStartRecovery, DeliveryOutcome, InMemoryStorage, OccurrenceStatus,
    RecurrenceRule, ReminderStore, RecoveryTrigger,
};
use std::sync::Arc;

async fn seed(rig: &Rig<InMemoryStorage>, count: u32) -> Vec<dosewatch::ReminderDefinition> {
    let mut defs = Vec::new();
    for i in 0..count {
        let def = daily(&format!("Med {}", i), hm(8 + i % 12, (i * 5) % 60), rig.clock.now());
        rig.store.put_reminder(def.clone()).await.unwrap();
        defs.push(def);
    }
    defs
}

/// Test: Boot and cold-start recovery firing together leave one armed
/// occurrence per reminder.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_recovery_triggers_converge() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 6, 0));
    let defs = seed(&rig, 20).await;

    let boot = BootRecovery::new(rig.engine.clone());
    let cold = ColdStartRecovery::new(rig.engine.clone());
    let (a, b) = tokio::join!(
        async { boot.recover().await.into_report().await.unwrap() },
        async { cold.recover().await.into_report().await.unwrap() },
    );

    assert_eq!(a.examined, 20);
    assert_eq!(b.examined, 20);
    // Whichever pass got to a reminder first armed it; the other re-armed.
    assert_eq!(a.armed + b.armed, 20);
    assert_eq!(a.rearmed + b.rearmed, 20);

    for def in &defs {
        let open = rig.open_occurrences(&def.id).await;
        assert_eq!(open.len(), 1, "{} should have one open occurrence", def.label);
        assert_eq!(open[0].status, OccurrenceStatus::Armed);
    }
    assert_eq!(rig.timer.armed().len(), 20);
}

/// Test: Rule edits racing a reconciliation pass end on the edited rule.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edits_racing_reconcile_use_latest_rule() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 6, 0));
    let defs = seed(&rig, 10).await;
    rig.engine.reconcile_all().await;

    let mut edits = Vec::new();
    for def in &defs {
        let engine = rig.engine.clone();
        let mut edited = def.clone();
        edited.rule = RecurrenceRule::daily(hm(22, 0));
        edits.push(tokio::spawn(async move { engine.save_reminder(edited).await }));
    }
    let pass = {
        let engine = rig.engine.clone();
        tokio::spawn(async move { engine.reconcile_all().await })
    };

    for edit in edits {
        edit.await.unwrap().unwrap();
    }
    assert!(pass.await.unwrap().is_clean());

    for def in &defs {
        let open = rig.open_occurrences(&def.id).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].fire_at, utc(2024, 5, 1, 22, 0));
        assert_eq!(rig.timer.armed_at(&open[0].id), Some(utc(2024, 5, 1, 22, 0)));
    }
    assert_eq!(rig.timer.armed().len(), 10);
}

/// Test: A fire callback racing a reconciliation pass is presented once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fire_callback_racing_reconcile_presents_once() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 7, 0));
    let aspirin = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(aspirin.clone()).await.unwrap();
    let armed = rig.store.latest_occurrence(&aspirin.id).await.unwrap().unwrap();

    // Slightly after the fire-time, still inside the grace window.
    rig.clock.set(utc(2024, 5, 1, 8, 1));
    let handler = rig.handler.clone();
    let engine = rig.engine.clone();
    let (fired, report) = tokio::join!(
        async move { handler.on_fire(armed.id).await.unwrap() },
        async move { engine.reconcile_all().await },
    );

    assert!(report.is_clean());
    let presented = rig.presenter.for_reminder(&aspirin.id);
    assert_eq!(presented.len(), 1);
    assert_eq!(presented[0].occurrence_id, armed.id);
    match fired {
        DeliveryOutcome::Delivered { .. } => assert_eq!(report.delivered_late, 0),
        DeliveryOutcome::Duplicate => assert_eq!(report.delivered_late, 1),
        other => panic!("unexpected outcome {:?}", other),
    }

    let open = rig.open_occurrences(&aspirin.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].fire_at, utc(2024, 5, 2, 8, 0));
}
