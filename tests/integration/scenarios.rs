//! End-to-end scheduling scenarios driven by a manual clock.

use crate::common::{Rig, daily, hm, utc};
use chrono::{DateTime, Utc, Weekday};
use dosewatch::{
    BootRecovery, Clock, DeliveryOutcome, InMemoryStorage, RecoveryTrigger, RecurrenceRule,
    ReminderDefinition, ReminderStore, ScheduleCalculator, WeeklySlot,
};
use std::sync::Arc;

fn fire_times(rig: &Rig<InMemoryStorage>) -> Vec<DateTime<Utc>> {
    rig.presenter
        .presentations()
        .iter()
        .map(|p| p.fire_at)
        .collect()
}

fn new_york() -> ScheduleCalculator {
    ScheduleCalculator::new("America/New_York").unwrap()
}

/// Test: Daily 02:30 in New York across the spring-forward weekend.
#[tokio::test]
async fn test_daily_across_spring_forward() {
    let rig = Rig::with_calculator(
        Arc::new(InMemoryStorage::new()),
        utc(2024, 3, 8, 0, 0),
        new_york(),
    );
    let dose = daily("Levothyroxine", hm(2, 30), rig.clock.now());
    rig.engine.save_reminder(dose).await.unwrap();

    let outcomes = rig.run_until(utc(2024, 3, 11, 12, 0)).await;
    assert_eq!(outcomes.len(), 4);
    assert_eq!(
        fire_times(&rig),
        vec![
            utc(2024, 3, 8, 7, 30),
            utc(2024, 3, 9, 7, 30),
            // 02:30 does not exist on the 10th; shifted to 03:30 EDT.
            utc(2024, 3, 10, 7, 30),
            utc(2024, 3, 11, 6, 30),
        ]
    );
    assert!(rig.presenter.presentations().iter().all(|p| !p.late));
}

/// Test: Daily 01:30 in New York across the fall-back weekend fires once on
/// the repeated hour.
#[tokio::test]
async fn test_daily_across_fall_back() {
    let rig = Rig::with_calculator(
        Arc::new(InMemoryStorage::new()),
        utc(2024, 11, 1, 12, 0),
        new_york(),
    );
    let dose = daily("Melatonin", hm(1, 30), rig.clock.now());
    rig.engine.save_reminder(dose).await.unwrap();

    rig.run_until(utc(2024, 11, 4, 12, 0)).await;
    assert_eq!(
        fire_times(&rig),
        vec![
            utc(2024, 11, 2, 5, 30),
            utc(2024, 11, 3, 5, 30),
            utc(2024, 11, 4, 6, 30),
        ]
    );
}

/// Test: Monday/Wednesday/Friday schedule over two weeks.
#[tokio::test]
async fn test_weekly_schedule_over_two_weeks() {
    // 2024-05-06 is a Monday.
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 6, 0, 0));
    let rule = RecurrenceRule::weekly([
        WeeklySlot::new(Weekday::Mon, hm(9, 0)),
        WeeklySlot::new(Weekday::Wed, hm(9, 0)),
        WeeklySlot::new(Weekday::Fri, hm(9, 0)),
    ])
    .unwrap();
    let dose = ReminderDefinition::new("Methotrexate", "2.5mg", rule).with_created_at(rig.clock.now());
    rig.engine.save_reminder(dose.clone()).await.unwrap();

    rig.run_until(utc(2024, 5, 19, 23, 0)).await;
    assert_eq!(
        fire_times(&rig),
        vec![
            utc(2024, 5, 6, 9, 0),
            utc(2024, 5, 8, 9, 0),
            utc(2024, 5, 10, 9, 0),
            utc(2024, 5, 13, 9, 0),
            utc(2024, 5, 15, 9, 0),
            utc(2024, 5, 17, 9, 0),
        ]
    );
    let open = rig.open_occurrences(&dose.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].fire_at, utc(2024, 5, 20, 9, 0));
}

/// Test: Every eight hours from a fixed start.
#[tokio::test]
async fn test_interval_every_eight_hours() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 0, 0));
    let rule = RecurrenceRule::interval(utc(2024, 5, 1, 6, 0), 8).unwrap();
    let dose = ReminderDefinition::new("Amoxicillin", "500mg", rule).with_created_at(rig.clock.now());
    rig.engine.save_reminder(dose).await.unwrap();

    rig.run_until(utc(2024, 5, 2, 6, 0)).await;
    assert_eq!(
        fire_times(&rig),
        vec![
            utc(2024, 5, 1, 6, 0),
            utc(2024, 5, 1, 14, 0),
            utc(2024, 5, 1, 22, 0),
            utc(2024, 5, 2, 6, 0),
        ]
    );
}

/// Test: A one-shot fires once and switches itself off.
#[tokio::test]
async fn test_one_shot_fires_once_then_deactivates() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 0, 0));
    let dose = ReminderDefinition::new(
        "Vaccine booster",
        "clinic visit",
        RecurrenceRule::once(utc(2024, 5, 1, 10, 0)),
    )
    .with_created_at(rig.clock.now());
    rig.engine.save_reminder(dose.clone()).await.unwrap();

    let outcomes = rig.run_until(utc(2024, 5, 3, 0, 0)).await;
    assert_eq!(
        outcomes,
        vec![DeliveryOutcome::Delivered {
            late: false,
            next_fire_at: None,
        }]
    );
    assert!(!rig.store.get_reminder(&dose.id).await.unwrap().unwrap().active);
    assert!(rig.timer.armed().is_empty());

    // Further passes leave it alone.
    let report = rig.engine.reconcile_all().await;
    assert_eq!(report.examined, 0);
    assert_eq!(rig.presenter.presentations().len(), 1);
}

/// Test: Process restart in the middle of a run keeps the daily cadence.
#[tokio::test]
async fn test_restart_mid_run_keeps_cadence() {
    let rig = Rig::new(Arc::new(InMemoryStorage::new()), utc(2024, 5, 1, 0, 0));
    let dose = daily("Aspirin", hm(8, 0), rig.clock.now());
    rig.engine.save_reminder(dose.clone()).await.unwrap();
    rig.run_until(utc(2024, 5, 2, 12, 0)).await;

    let restarted = rig.restart();
    assert!(restarted.timer.armed().is_empty());
    BootRecovery::new(restarted.engine.clone())
        .recover()
        .await
        .into_report()
        .await
        .unwrap();
    restarted.run_until(utc(2024, 5, 4, 12, 0)).await;

    assert_eq!(
        fire_times(&rig),
        vec![
            utc(2024, 5, 1, 8, 0),
            utc(2024, 5, 2, 8, 0),
            utc(2024, 5, 3, 8, 0),
            utc(2024, 5, 4, 8, 0),
        ]
    );
    assert!(rig.presenter.presentations().iter().all(|p| !p.late));
    assert_eq!(restarted.open_occurrences(&dose.id).await.len(), 1);
}
