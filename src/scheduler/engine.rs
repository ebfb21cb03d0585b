//! Scheduling engine implementation.
//!
//! The engine is responsible for:
//! - Turning reminder definitions into concrete, armed occurrences
//! - Reconciling every active reminder after a restart
//! - Catching up on occurrences that elapsed while nothing was running
//! - Cancelling occurrences when a reminder is edited, deactivated or deleted
//! - Event emission

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::locks::ReminderLocks;
use super::types::{EngineSettings, ReconcileReport, SchedulerError};
use crate::core::clock::{Clock, SystemClock};
use crate::core::occurrence::{OccurrenceStatus, ScheduledOccurrence};
use crate::core::reminder::ReminderDefinition;
use crate::core::retry::RetryPolicy;
use crate::core::schedule::ScheduleCalculator;
use crate::core::types::{OccurrenceId, ReminderId};
use crate::delivery::{Presentation, Presenter};
use crate::events::{Event, EventBus};
use crate::storage::{ActiveReminders, ReminderStore, StorageError};
use crate::timer::{Armed, FireTimer, TimerRejection};

/// Reconciliation orchestrator.
///
/// Cheap to clone; clones share the store, timer, locks and event bus.
pub struct SchedulingEngine<S: ReminderStore, T: FireTimer> {
    /// Storage backend.
    store: Arc<S>,
    /// Platform wake primitive.
    timer: Arc<T>,
    /// Notification surface for catch-up deliveries.
    presenter: Arc<dyn Presenter>,
    /// Source of "now".
    clock: Arc<dyn Clock>,
    calculator: ScheduleCalculator,
    locks: ReminderLocks,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    settings: EngineSettings,
}

impl<S: ReminderStore, T: FireTimer> Clone for SchedulingEngine<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            timer: Arc::clone(&self.timer),
            presenter: Arc::clone(&self.presenter),
            clock: Arc::clone(&self.clock),
            calculator: self.calculator,
            locks: self.locks.clone(),
            event_bus: Arc::clone(&self.event_bus),
            settings: self.settings.clone(),
        }
    }
}

impl<S: ReminderStore + 'static, T: FireTimer + 'static> SchedulingEngine<S, T> {
    /// Create an engine on the system clock with default settings and a UTC
    /// calculator.
    pub fn new(store: Arc<S>, timer: Arc<T>, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            store,
            timer,
            presenter,
            clock: Arc::new(SystemClock),
            calculator: ScheduleCalculator::default(),
            locks: ReminderLocks::new(),
            event_bus: Arc::new(EventBus::new()),
            settings: EngineSettings::default(),
        }
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the schedule calculator.
    pub fn with_calculator(mut self, calculator: ScheduleCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Replace all settings at once.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the grace window.
    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.settings.grace_window = grace_window;
        self
    }

    /// Set the storage retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.settings.retry = retry;
        self
    }

    /// Set how many reminders reconcile concurrently.
    pub fn with_max_parallel_reconciles(mut self, max: usize) -> Self {
        self.settings.max_parallel_reconciles = max.max(1);
        self
    }

    /// Set the active-reminder page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.settings.page_size = page_size.max(1);
        self
    }

    /// Set the per-call store timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.settings.store_timeout = timeout;
        self
    }

    /// Set the per-call timer timeout.
    pub fn with_timer_timeout(mut self, timeout: Duration) -> Self {
        self.settings.timer_timeout = timeout;
        self
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the timer.
    pub fn timer(&self) -> &Arc<T> {
        &self.timer
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn calculator(&self) -> &ScheduleCalculator {
        &self.calculator
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn locks(&self) -> &ReminderLocks {
        &self.locks
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Reconcile every active reminder.
    ///
    /// Reminders are processed concurrently up to the configured limit, each
    /// under its own lock. A reminder that keeps failing after all retries is
    /// listed in [`ReconcileReport::failed`] and the pass carries on.
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let started = Instant::now();
        let mut report = ReconcileReport::default();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_reconciles.max(1)));
        let mut tasks = JoinSet::new();
        let mut spawned: HashSet<ReminderId> = HashSet::new();
        let mut pages = self.store.list_active(self.settings.page_size);

        loop {
            let page = match self.next_page(&mut pages).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(cursor = ?pages.cursor(), error = %e, "Failed to list active reminders");
                    report.incomplete = true;
                    break;
                }
            };

            for definition in page {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let engine = self.clone();
                let id = definition.id;
                spawned.insert(id);
                tasks.spawn(async move {
                    let _permit = permit;
                    (id, engine.reconcile_with_retry(id).await)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(outcome))) => {
                    spawned.remove(&id);
                    report.merge(outcome);
                }
                Ok((id, Err(e))) => {
                    spawned.remove(&id);
                    tracing::error!(reminder_id = %id, error = %e, "Reconciliation failed after retries");
                    report.examined += 1;
                    report.failed.push(id);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Reconciliation task aborted");
                }
            }
        }
        // Whatever is left belongs to tasks that never reported back.
        for id in spawned {
            report.examined += 1;
            report.failed.push(id);
        }

        let duration = started.elapsed();
        tracing::info!(
            examined = report.examined,
            armed = report.armed,
            rearmed = report.rearmed,
            delivered_late = report.delivered_late,
            missed = report.missed,
            rejected = report.rejected,
            failed = report.failed.len(),
            duration_ms = duration.as_millis() as u64,
            "Reconciliation pass complete"
        );
        self.event_bus
            .emit(Event::reconcile_completed(
                report.examined,
                report.armed + report.rearmed,
                report.failed.len(),
                duration,
                self.now(),
            ))
            .await;

        report
    }

    /// Reconcile a single reminder.
    pub async fn reconcile_reminder(
        &self,
        id: &ReminderId,
    ) -> Result<ReconcileReport, SchedulerError> {
        Ok(self.reconcile_with_retry(*id).await?)
    }

    /// Persist a reminder definition and bring its occurrences in line with
    /// it.
    pub async fn save_reminder(
        &self,
        definition: ReminderDefinition,
    ) -> Result<ReconcileReport, SchedulerError> {
        definition.rule.validate()?;
        let id = definition.id;
        let _guard = self.locks.lock(id).await;
        self.store_call("put_reminder", self.store.put_reminder(definition))
            .await?;
        Ok(self.reconcile_locked(&id).await?)
    }

    /// Switch a reminder off, cancelling its open occurrence first.
    pub async fn deactivate_reminder(&self, id: &ReminderId) -> Result<(), SchedulerError> {
        let _guard = self.locks.lock(*id).await;
        let mut definition = self
            .load_reminder(id)
            .await?
            .ok_or(SchedulerError::ReminderNotFound(*id))?;
        let now = self.now();
        self.cancel_open(id, now).await?;
        if definition.active {
            definition.deactivate(now);
            self.store_call("put_reminder", self.store.put_reminder(definition))
                .await?;
            tracing::info!(reminder_id = %id, "Reminder deactivated");
            self.event_bus.emit(Event::deactivated(*id, now)).await;
        }
        Ok(())
    }

    /// Remove a reminder, cancelling its open occurrence first. Occurrence
    /// history is kept.
    pub async fn delete_reminder(&self, id: &ReminderId) -> Result<(), SchedulerError> {
        let _guard = self.locks.lock(*id).await;
        if self.load_reminder(id).await?.is_none() {
            return Err(SchedulerError::ReminderNotFound(*id));
        }
        self.cancel_open(id, self.now()).await?;
        self.store_call("delete_reminder", self.store.delete_reminder(id))
            .await?;
        tracing::info!(reminder_id = %id, "Reminder deleted");
        Ok(())
    }

    async fn next_page(
        &self,
        pages: &mut ActiveReminders<'_, S>,
    ) -> Result<Option<Vec<ReminderDefinition>>, StorageError> {
        let retry = &self.settings.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(self.settings.store_timeout, pages.next_page())
                .await
            {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout("list_active_after".into())),
            };
            match result {
                Err(e) if retry.should_retry(attempts, &e) => {
                    let delay = retry.delay_for(attempts);
                    tracing::warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %e, "Listing active reminders failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn reconcile_with_retry(&self, id: ReminderId) -> Result<ReconcileReport, StorageError> {
        self.settings
            .retry
            .run("reconcile_reminder", || async move {
                let _guard = self.locks.lock(id).await;
                self.reconcile_locked(&id).await
            })
            .await
    }

    /// Bring one reminder's occurrences in line with its definition. Must be
    /// called with the reminder's lock held.
    async fn reconcile_locked(&self, id: &ReminderId) -> Result<ReconcileReport, StorageError> {
        self.reconcile_step(id, false)
            .await
            .map(|(report, _)| report)
    }

    /// Schedule the occurrence that follows one just delivered, retrying
    /// storage failures. Must be called with the reminder's lock held.
    ///
    /// Every attempt recomputes from the persisted state, so an attempt that
    /// failed halfway is picked up by the next one.
    pub(crate) async fn schedule_after_delivery(
        &self,
        id: &ReminderId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        let id = *id;
        self.settings
            .retry
            .run("schedule_after_delivery", || async move {
                self.reconcile_step(&id, true).await.map(|(_, next)| next)
            })
            .await
    }

    /// One reconciliation of a reminder. `presented` is set when the caller
    /// already presented an occurrence of this reminder. Returns the open
    /// occurrence left behind, if any.
    async fn reconcile_step(
        &self,
        id: &ReminderId,
        presented: bool,
    ) -> Result<(ReconcileReport, Option<ScheduledOccurrence>), StorageError> {
        let mut report = ReconcileReport::for_one();
        let now = self.now();
        let definition = self.load_reminder(id).await?;
        let latest = self
            .store_call("latest_occurrence", self.store.latest_occurrence(id))
            .await?;

        let definition = match definition {
            Some(definition) if definition.active => definition,
            _ => {
                if let Some(open) = latest.filter(|o| o.is_open()) {
                    self.cancel_occurrence(&open, now).await?;
                    report.cancelled += 1;
                }
                return Ok((report, None));
            }
        };

        let mut floor = now;
        let mut presented = presented;
        if let Some(latest) = latest {
            match latest.status {
                OccurrenceStatus::Pending | OccurrenceStatus::Armed if latest.fire_at > now => {
                    // Still the earliest fire-time after the instant it was
                    // computed from: keep it.
                    let expected = self
                        .calculator
                        .next_fire_time(&definition, now.max(latest.scheduled_after));
                    if expected == Some(latest.fire_at) {
                        self.rearm(&latest, now, &mut report).await?;
                        return Ok((report, Some(latest)));
                    }
                    tracing::debug!(reminder_id = %id, occurrence_id = %latest.id, "Open occurrence no longer matches rule");
                    self.cancel_occurrence(&latest, now).await?;
                    report.cancelled += 1;
                }
                OccurrenceStatus::Pending | OccurrenceStatus::Armed => {
                    if self.beyond_grace(&latest, now) {
                        self.mark_missed(&latest, now).await?;
                        report.missed += 1;
                    } else {
                        self.deliver(&definition, &latest, true, now).await?;
                        report.delivered_late += 1;
                        presented = true;
                    }
                }
                OccurrenceStatus::Delivered | OccurrenceStatus::Missed => {
                    floor = floor.max(latest.fire_at);
                }
                OccurrenceStatus::Cancelled => {}
            }
        }

        let next = self
            .schedule_next(&definition, floor, now, presented, &mut report)
            .await?;
        Ok((report, next))
    }

    /// Record and arm the first occurrence strictly after `floor`, or
    /// deactivate the reminder if its rule has run out.
    ///
    /// A timer rejection marks the new occurrence Missed, presents it with
    /// the late flag unless something was already presented for this
    /// reminder, and records the following occurrence unarmed so the next
    /// recovery trigger can pick it up.
    async fn schedule_next(
        &self,
        definition: &ReminderDefinition,
        floor: DateTime<Utc>,
        now: DateTime<Utc>,
        presented: bool,
        report: &mut ReconcileReport,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        let Some(fire_at) = self.calculator.next_fire_time(definition, floor) else {
            self.deactivate_exhausted(definition, now).await?;
            report.exhausted += 1;
            return Ok(None);
        };

        let mut occurrence =
            ScheduledOccurrence::new(definition.id, fire_at, now).with_scheduled_after(floor);
        self.store_call(
            "record_occurrence",
            self.store.record_occurrence(occurrence.clone()),
        )
        .await?;

        match self.arm_timer(occurrence.id, fire_at).await {
            Ok(_) => {
                self.set_status(&occurrence.id, OccurrenceStatus::Armed, now)
                    .await?;
                occurrence.transition(OccurrenceStatus::Armed, now);
                tracing::debug!(reminder_id = %definition.id, occurrence_id = %occurrence.id, fire_at = %fire_at, "Occurrence armed");
                self.event_bus
                    .emit(Event::armed(definition.id, occurrence.id, fire_at, now))
                    .await;
                report.armed += 1;
                Ok(Some(occurrence))
            }
            Err(rejection) => {
                self.report_rejection(definition, &occurrence, rejection, now, report)
                    .await;
                self.mark_missed(&occurrence, now).await?;
                report.missed += 1;
                if !presented {
                    self.present(definition, &occurrence, true).await;
                }

                let Some(following_at) = self.calculator.next_fire_time(definition, fire_at)
                else {
                    self.deactivate_exhausted(definition, now).await?;
                    report.exhausted += 1;
                    return Ok(None);
                };
                let following = ScheduledOccurrence::new(definition.id, following_at, now)
                    .with_scheduled_after(fire_at);
                self.store_call(
                    "record_occurrence",
                    self.store.record_occurrence(following.clone()),
                )
                .await?;
                Ok(Some(following))
            }
        }
    }

    /// Arm an existing open occurrence again. A rejection leaves it Pending
    /// for the next recovery trigger.
    async fn rearm(
        &self,
        occurrence: &ScheduledOccurrence,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), StorageError> {
        match self.arm_timer(occurrence.id, occurrence.fire_at).await {
            Ok(_) => {
                if occurrence.status != OccurrenceStatus::Armed {
                    self.set_status(&occurrence.id, OccurrenceStatus::Armed, now)
                        .await?;
                }
                tracing::debug!(reminder_id = %occurrence.reminder_id, occurrence_id = %occurrence.id, "Occurrence re-armed");
                self.event_bus
                    .emit(Event::armed(
                        occurrence.reminder_id,
                        occurrence.id,
                        occurrence.fire_at,
                        now,
                    ))
                    .await;
                report.rearmed += 1;
            }
            Err(rejection) => {
                if occurrence.status != OccurrenceStatus::Pending {
                    self.set_status(&occurrence.id, OccurrenceStatus::Pending, now)
                        .await?;
                }
                let id = occurrence.reminder_id;
                tracing::warn!(reminder_id = %id, occurrence_id = %occurrence.id, reason = %rejection, "Timer refused re-arm, leaving occurrence pending");
                self.event_bus
                    .emit(Event::timer_rejected(id, occurrence.id, rejection, now))
                    .await;
                report.rejected += 1;
            }
        }
        Ok(())
    }

    async fn report_rejection(
        &self,
        definition: &ReminderDefinition,
        occurrence: &ScheduledOccurrence,
        rejection: TimerRejection,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) {
        tracing::warn!(
            reminder_id = %definition.id,
            occurrence_id = %occurrence.id,
            fire_at = %occurrence.fire_at,
            reason = %rejection,
            "Timer rejected wake request"
        );
        self.event_bus
            .emit(Event::timer_rejected(
                definition.id,
                occurrence.id,
                rejection,
                now,
            ))
            .await;
        report.rejected += 1;
    }

    /// Mark an occurrence Delivered and present it.
    pub(crate) async fn deliver(
        &self,
        definition: &ReminderDefinition,
        occurrence: &ScheduledOccurrence,
        late: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.store_call(
            "mark_delivered",
            self.store.mark_delivered(&occurrence.id, late, now),
        )
        .await?;
        if late {
            tracing::info!(reminder_id = %definition.id, occurrence_id = %occurrence.id, fire_at = %occurrence.fire_at, "Delivering occurrence late");
        }
        self.event_bus
            .emit(Event::delivered(definition.id, occurrence.id, late, now))
            .await;
        self.present(definition, occurrence, late).await;
        Ok(())
    }

    pub(crate) async fn cancel_occurrence(
        &self,
        occurrence: &ScheduledOccurrence,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.cancel_timer(occurrence.id).await;
        self.set_status(&occurrence.id, OccurrenceStatus::Cancelled, now)
            .await?;
        tracing::debug!(reminder_id = %occurrence.reminder_id, occurrence_id = %occurrence.id, "Occurrence cancelled");
        self.event_bus
            .emit(Event::cancelled(occurrence.reminder_id, occurrence.id, now))
            .await;
        Ok(())
    }

    async fn cancel_open(&self, id: &ReminderId, now: DateTime<Utc>) -> Result<(), StorageError> {
        let latest = self
            .store_call("latest_occurrence", self.store.latest_occurrence(id))
            .await?;
        if let Some(open) = latest.filter(|o| o.is_open()) {
            self.cancel_occurrence(&open, now).await?;
        }
        Ok(())
    }

    async fn mark_missed(
        &self,
        occurrence: &ScheduledOccurrence,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.set_status(&occurrence.id, OccurrenceStatus::Missed, now)
            .await?;
        tracing::warn!(
            reminder_id = %occurrence.reminder_id,
            occurrence_id = %occurrence.id,
            fire_at = %occurrence.fire_at,
            "Occurrence missed"
        );
        self.event_bus
            .emit(Event::missed(
                occurrence.reminder_id,
                occurrence.id,
                occurrence.fire_at,
                now,
            ))
            .await;
        Ok(())
    }

    async fn deactivate_exhausted(
        &self,
        definition: &ReminderDefinition,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut definition = definition.clone();
        definition.deactivate(now);
        let id = definition.id;
        self.store_call("put_reminder", self.store.put_reminder(definition))
            .await?;
        tracing::info!(reminder_id = %id, "Reminder has no further fire-times, deactivated");
        self.event_bus.emit(Event::deactivated(id, now)).await;
        Ok(())
    }

    async fn present(
        &self,
        definition: &ReminderDefinition,
        occurrence: &ScheduledOccurrence,
        late: bool,
    ) {
        let presentation = Presentation::new(definition, occurrence, late);
        if let Err(e) = self.presenter.present(presentation).await {
            tracing::warn!(reminder_id = %definition.id, occurrence_id = %occurrence.id, error = %e, "Failed to present reminder");
        }
    }

    pub(crate) fn beyond_grace(&self, occurrence: &ScheduledOccurrence, now: DateTime<Utc>) -> bool {
        match (now - occurrence.fire_at).to_std() {
            Ok(elapsed) => elapsed > self.settings.grace_window,
            Err(_) => false,
        }
    }

    pub(crate) async fn load_reminder(
        &self,
        id: &ReminderId,
    ) -> Result<Option<ReminderDefinition>, StorageError> {
        self.store_call("get_reminder", self.store.get_reminder(id))
            .await
    }

    pub(crate) async fn load_occurrence(
        &self,
        id: &OccurrenceId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        self.store_call("get_occurrence", self.store.get_occurrence(id))
            .await
    }

    async fn set_status(
        &self,
        id: &OccurrenceId,
        status: OccurrenceStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.store_call(
            "update_occurrence_status",
            self.store.update_occurrence_status(id, status, now),
        )
        .await
    }

    async fn arm_timer(
        &self,
        occurrence_id: OccurrenceId,
        at: DateTime<Utc>,
    ) -> Result<Armed, TimerRejection> {
        tokio::time::timeout(
            self.settings.timer_timeout,
            self.timer.arm(occurrence_id, at),
        )
        .await
        .unwrap_or(Err(TimerRejection::Timeout))
    }

    async fn cancel_timer(&self, occurrence_id: OccurrenceId) {
        if tokio::time::timeout(self.settings.timer_timeout, self.timer.cancel(occurrence_id))
            .await
            .is_err()
        {
            tracing::warn!(occurrence_id = %occurrence_id, "Timer cancel timed out");
        }
    }

    async fn store_call<R, F>(&self, operation: &str, call: F) -> Result<R, StorageError>
    where
        F: Future<Output = Result<R, StorageError>>,
    {
        tokio::time::timeout(self.settings.store_timeout, call)
            .await
            .map_err(|_| StorageError::Timeout(operation.to_string()))?
    }
}
