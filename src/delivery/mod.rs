//! Fire-callback handling and notification presentation.
//!
//! The timer hands back nothing but an [`OccurrenceId`]. The
//! [`DeliveryHandler`] rehydrates everything else from the store, guards
//! against duplicate and stale callbacks, presents the reminder, and asks the
//! engine to line up the next occurrence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::core::occurrence::{OccurrenceStatus, ScheduledOccurrence};
use crate::core::reminder::ReminderDefinition;
use crate::core::types::{OccurrenceId, ReminderId};
use crate::scheduler::{SchedulerError, SchedulingEngine};
use crate::storage::ReminderStore;
use crate::timer::{FireCallbacks, FireTimer};

/// Failure reported by a presenter.
#[derive(Debug, Error)]
#[error("presentation failed: {0}")]
pub struct PresentError(pub String);

/// What the user is shown for one occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presentation {
    pub reminder_id: ReminderId,
    pub occurrence_id: OccurrenceId,
    pub label: String,
    pub dose_note: String,
    pub fire_at: DateTime<Utc>,
    /// The reminder may be delayed: shown through the catch-up path.
    pub late: bool,
}

impl Presentation {
    pub fn new(
        definition: &ReminderDefinition,
        occurrence: &ScheduledOccurrence,
        late: bool,
    ) -> Self {
        Self {
            reminder_id: definition.id,
            occurrence_id: occurrence.id,
            label: definition.label.clone(),
            dose_note: definition.dose_note.clone(),
            fire_at: occurrence.fire_at,
            late,
        }
    }
}

/// Notification surface. Fire-and-forget: failures are logged by the caller
/// and never undo the state transition that preceded them.
#[async_trait]
pub trait Presenter: Send + Sync {
    async fn present(&self, presentation: Presentation) -> Result<(), PresentError>;
}

/// Presenter that only writes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPresenter;

#[async_trait]
impl Presenter for LogPresenter {
    async fn present(&self, presentation: Presentation) -> Result<(), PresentError> {
        tracing::info!(
            reminder_id = %presentation.reminder_id,
            occurrence_id = %presentation.occurrence_id,
            label = %presentation.label,
            late = presentation.late,
            "Reminder due"
        );
        Ok(())
    }
}

/// Result of handling one fire callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// No such occurrence in the store.
    UnknownOccurrence,
    /// Already delivered or cancelled.
    Duplicate,
    /// Marked Missed by an earlier reconciliation.
    Superseded,
    /// Delivered now.
    Delivered {
        late: bool,
        /// Fire-time of the occurrence scheduled next, if the rule recurs.
        next_fire_at: Option<DateTime<Utc>>,
    },
}

/// Idempotent handler for fire callbacks.
pub struct DeliveryHandler<S: ReminderStore, T: FireTimer> {
    engine: SchedulingEngine<S, T>,
}

impl<S: ReminderStore, T: FireTimer> Clone for DeliveryHandler<S, T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<S: ReminderStore + 'static, T: FireTimer + 'static> DeliveryHandler<S, T> {
    pub fn new(engine: SchedulingEngine<S, T>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &SchedulingEngine<S, T> {
        &self.engine
    }

    /// Handle a fire callback for `occurrence_id`.
    ///
    /// Safe to call any number of times for the same id: only the first call
    /// transitions the occurrence and presents it.
    pub async fn on_fire(
        &self,
        occurrence_id: OccurrenceId,
    ) -> Result<DeliveryOutcome, SchedulerError> {
        let engine = &self.engine;
        let Some(occurrence) = engine.load_occurrence(&occurrence_id).await? else {
            tracing::warn!(occurrence_id = %occurrence_id, "Fire callback for unknown occurrence");
            return Ok(DeliveryOutcome::UnknownOccurrence);
        };

        let _guard = engine.locks().lock(occurrence.reminder_id).await;

        // Another callback or a reconciliation may have won the race.
        let Some(occurrence) = engine.load_occurrence(&occurrence_id).await? else {
            tracing::warn!(occurrence_id = %occurrence_id, "Occurrence vanished before delivery");
            return Ok(DeliveryOutcome::UnknownOccurrence);
        };
        match occurrence.status {
            OccurrenceStatus::Delivered | OccurrenceStatus::Cancelled => {
                tracing::debug!(occurrence_id = %occurrence_id, status = %occurrence.status, "Ignoring duplicate fire callback");
                return Ok(DeliveryOutcome::Duplicate);
            }
            OccurrenceStatus::Missed => {
                tracing::debug!(occurrence_id = %occurrence_id, "Ignoring fire callback for missed occurrence");
                return Ok(DeliveryOutcome::Superseded);
            }
            OccurrenceStatus::Pending | OccurrenceStatus::Armed => {}
        }

        let now = engine.now();
        let definition = match engine.load_reminder(&occurrence.reminder_id).await? {
            Some(definition) if definition.active => definition,
            _ => {
                // Deactivation always cancels first, so this is a stale row.
                engine.cancel_occurrence(&occurrence, now).await?;
                return Ok(DeliveryOutcome::Superseded);
            }
        };

        let late = engine.beyond_grace(&occurrence, now);
        engine.deliver(&definition, &occurrence, late, now).await?;

        let next = engine.schedule_after_delivery(&definition.id).await?;

        Ok(DeliveryOutcome::Delivered {
            late,
            next_fire_at: next.map(|o| o.fire_at),
        })
    }
}

/// Drive [`DeliveryHandler::on_fire`] from a timer's callbacks until the
/// timer is dropped.
pub fn spawn_callback_loop<S, T>(
    handler: DeliveryHandler<S, T>,
    mut callbacks: FireCallbacks,
) -> JoinHandle<()>
where
    S: ReminderStore + 'static,
    T: FireTimer + 'static,
{
    tokio::spawn(async move {
        while let Some(occurrence_id) = callbacks.recv().await {
            match handler.on_fire(occurrence_id).await {
                Ok(outcome) => {
                    tracing::debug!(occurrence_id = %occurrence_id, outcome = ?outcome, "Fire callback handled");
                }
                Err(e) => {
                    tracing::error!(occurrence_id = %occurrence_id, error = %e, "Fire callback failed");
                }
            }
        }
        tracing::debug!("Fire callback loop finished");
    })
}
