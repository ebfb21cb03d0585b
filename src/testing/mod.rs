//! Testing utilities for users of the dosewatch library.
//!
//! This module provides deterministic stand-ins for the engine's
//! collaborators:
//!
//! - [`ManualClock`]: A clock that only moves when told to
//! - [`ManualFireTimer`]: A fire timer that records wake requests instead of
//!   sleeping, with scriptable rejections
//! - [`RecordingPresenter`]: Captures every presentation
//! - [`FlakyStore`]: Wraps a store and injects failures and latency

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::clock::Clock;
use crate::core::occurrence::{OccurrenceStatus, ScheduledOccurrence};
use crate::core::reminder::ReminderDefinition;
use crate::core::types::{OccurrenceId, ReminderId};
use crate::delivery::{PresentError, Presentation, Presenter};
use crate::storage::{ReminderStore, StorageError};
use crate::timer::{Armed, FireTimer, TimerRejection};

/// A clock that only moves when told to.
///
/// # Example
///
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use dosewatch::core::clock::Clock;
/// use dosewatch::testing::ManualClock;
///
/// let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap());
/// clock.advance(Duration::hours(3));
/// assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap());
/// ```
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Jump to an instant. Moving backwards is allowed.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct TimerState {
    armed: HashMap<OccurrenceId, DateTime<Utc>>,
    cancelled: Vec<OccurrenceId>,
    arm_calls: usize,
    rejection: Option<TimerRejection>,
}

/// A fire timer that records wake requests instead of sleeping.
///
/// Tests decide when callbacks happen by draining [`take_due`](Self::take_due)
/// and passing the ids to a delivery handler. [`clear`](Self::clear) drops
/// every request, the way a reboot does.
pub struct ManualFireTimer {
    clock: Arc<dyn Clock>,
    state: Mutex<TimerState>,
}

impl ManualFireTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(TimerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse every following arm request with `rejection`, or accept them
    /// again with `None`.
    pub fn reject_with(&self, rejection: Option<TimerRejection>) {
        self.state().rejection = rejection;
    }

    /// Outstanding requests, earliest first.
    pub fn armed(&self) -> Vec<(OccurrenceId, DateTime<Utc>)> {
        let mut armed: Vec<_> = self.state().armed.iter().map(|(id, at)| (*id, *at)).collect();
        armed.sort_by_key(|(id, at)| (*at, *id));
        armed
    }

    pub fn is_armed(&self, id: &OccurrenceId) -> bool {
        self.state().armed.contains_key(id)
    }

    pub fn armed_at(&self, id: &OccurrenceId) -> Option<DateTime<Utc>> {
        self.state().armed.get(id).copied()
    }

    /// Every id passed to `cancel`, in call order.
    pub fn cancelled(&self) -> Vec<OccurrenceId> {
        self.state().cancelled.clone()
    }

    /// Number of arm calls, accepted or not.
    pub fn arm_calls(&self) -> usize {
        self.state().arm_calls
    }

    /// Forget every outstanding request.
    pub fn clear(&self) {
        self.state().armed.clear();
    }

    /// Remove and return requests whose instant has been reached, earliest
    /// first.
    pub fn take_due(&self) -> Vec<OccurrenceId> {
        let now = self.clock.now();
        let mut state = self.state();
        let mut due: Vec<_> = state
            .armed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (*at, *id))
            .collect();
        due.sort();
        for (_, id) in &due {
            state.armed.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }
}

#[async_trait]
impl FireTimer for ManualFireTimer {
    async fn arm(
        &self,
        occurrence_id: OccurrenceId,
        at: DateTime<Utc>,
    ) -> Result<Armed, TimerRejection> {
        let now = self.clock.now();
        let mut state = self.state();
        state.arm_calls += 1;
        if let Some(rejection) = &state.rejection {
            return Err(rejection.clone());
        }
        if at <= now {
            return Err(TimerRejection::InPast(at));
        }
        state.armed.insert(occurrence_id, at);
        Ok(Armed { occurrence_id, at })
    }

    async fn cancel(&self, occurrence_id: OccurrenceId) {
        let mut state = self.state();
        state.armed.remove(&occurrence_id);
        state.cancelled.push(occurrence_id);
    }
}

/// Presenter that captures every presentation.
#[derive(Default)]
pub struct RecordingPresenter {
    presentations: Mutex<Vec<Presentation>>,
    failing: AtomicBool,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `present` call fail after recording it.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn presentations(&self) -> Vec<Presentation> {
        self.presentations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Presentations for one reminder.
    pub fn for_reminder(&self, id: &ReminderId) -> Vec<Presentation> {
        self.presentations()
            .into_iter()
            .filter(|p| &p.reminder_id == id)
            .collect()
    }
}

#[async_trait]
impl Presenter for RecordingPresenter {
    async fn present(&self, presentation: Presentation) -> Result<(), PresentError> {
        self.presentations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(presentation);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PresentError("notification channel disabled".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FaultPlan {
    fail_next: u32,
    fail_after: Option<u32>,
    fail_operation: Option<(&'static str, u32)>,
    injected: u32,
}

/// Store wrapper that injects failures and latency.
///
/// Injected failures are [`StorageError::Other`], which the engine treats as
/// transient.
pub struct FlakyStore<S: ReminderStore> {
    inner: Arc<S>,
    plan: Mutex<FaultPlan>,
    latency: Option<std::time::Duration>,
}

impl<S: ReminderStore> FlakyStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            plan: Mutex::new(FaultPlan::default()),
            latency: None,
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: u32) {
        self.plan().fail_next = count;
    }

    /// Let `successes` more calls through, then fail every call until
    /// [`heal`](Self::heal).
    pub fn fail_after(&self, successes: u32) {
        self.plan().fail_after = Some(successes);
    }

    /// Fail the next `count` calls to `operation` (a [`ReminderStore`]
    /// method name). Other calls go through.
    pub fn fail_on(&self, operation: &'static str, count: u32) {
        self.plan().fail_operation = Some((operation, count));
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        let mut plan = self.plan();
        plan.fail_next = 0;
        plan.fail_after = None;
        plan.fail_operation = None;
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> u32 {
        self.plan().injected
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    fn plan(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.plan.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn inject(&self, operation: &str) -> Result<(), StorageError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut plan = self.plan();
        let targeted = match &mut plan.fail_operation {
            Some((target, remaining)) if *target == operation && *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        let fail = if targeted {
            true
        } else if plan.fail_next > 0 {
            plan.fail_next -= 1;
            true
        } else {
            match plan.fail_after {
                Some(0) => true,
                Some(remaining) => {
                    plan.fail_after = Some(remaining - 1);
                    false
                }
                None => false,
            }
        };
        if fail {
            plan.injected += 1;
            return Err(StorageError::Other(format!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ReminderStore> ReminderStore for FlakyStore<S> {
    async fn put_reminder(&self, reminder: ReminderDefinition) -> Result<(), StorageError> {
        self.inject("put_reminder").await?;
        self.inner.put_reminder(reminder).await
    }

    async fn get_reminder(
        &self,
        id: &ReminderId,
    ) -> Result<Option<ReminderDefinition>, StorageError> {
        self.inject("get_reminder").await?;
        self.inner.get_reminder(id).await
    }

    async fn delete_reminder(&self, id: &ReminderId) -> Result<(), StorageError> {
        self.inject("delete_reminder").await?;
        self.inner.delete_reminder(id).await
    }

    async fn list_active_after(
        &self,
        after: Option<&ReminderId>,
        limit: usize,
    ) -> Result<Vec<ReminderDefinition>, StorageError> {
        self.inject("list_active_after").await?;
        self.inner.list_active_after(after, limit).await
    }

    async fn record_occurrence(&self, occurrence: ScheduledOccurrence) -> Result<(), StorageError> {
        self.inject("record_occurrence").await?;
        self.inner.record_occurrence(occurrence).await
    }

    async fn get_occurrence(
        &self,
        id: &OccurrenceId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        self.inject("get_occurrence").await?;
        self.inner.get_occurrence(id).await
    }

    async fn latest_occurrence(
        &self,
        reminder_id: &ReminderId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        self.inject("latest_occurrence").await?;
        self.inner.latest_occurrence(reminder_id).await
    }

    async fn list_occurrences(
        &self,
        reminder_id: &ReminderId,
    ) -> Result<Vec<ScheduledOccurrence>, StorageError> {
        self.inject("list_occurrences").await?;
        self.inner.list_occurrences(reminder_id).await
    }

    async fn update_occurrence_status(
        &self,
        id: &OccurrenceId,
        status: OccurrenceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inject("update_occurrence_status").await?;
        self.inner.update_occurrence_status(id, status, at).await
    }

    async fn mark_delivered(
        &self,
        id: &OccurrenceId,
        late: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inject("mark_delivered").await?;
        self.inner.mark_delivered(id, late, at).await
    }
}
