//! Scheduler type definitions.
//!
//! This module contains the error type, engine settings and the report
//! produced by a reconciliation pass.

use std::time::Duration;
use thiserror::Error;

use crate::core::retry::RetryPolicy;
use crate::core::schedule::ScheduleError;
use crate::core::types::ReminderId;
use crate::storage::{DEFAULT_PAGE_SIZE, StorageError};

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Reminder not found.
    #[error("reminder not found: {0}")]
    ReminderNotFound(ReminderId),

    /// The reminder's rule is invalid.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// A background reconciliation task failed to complete.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Tunables for the scheduling engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long after its fire-time an open occurrence is still delivered.
    pub grace_window: Duration,
    /// Upper bound for a single store call.
    pub store_timeout: Duration,
    /// Upper bound for a single timer call.
    pub timer_timeout: Duration,
    /// Reminders reconciled concurrently during a full pass.
    pub max_parallel_reconciles: usize,
    /// Active reminders fetched per page.
    pub page_size: usize,
    /// Backoff applied to storage failures.
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(600),
            store_timeout: Duration::from_secs(5),
            timer_timeout: Duration::from_secs(2),
            max_parallel_reconciles: 4,
            page_size: DEFAULT_PAGE_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Summary of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Reminders looked at.
    pub examined: usize,
    /// Newly recorded occurrences the timer accepted.
    pub armed: usize,
    /// Existing open occurrences armed again.
    pub rearmed: usize,
    /// Elapsed occurrences delivered through the catch-up path.
    pub delivered_late: usize,
    /// Occurrences marked Missed.
    pub missed: usize,
    /// Open occurrences withdrawn because the reminder changed.
    pub cancelled: usize,
    /// Wake requests the timer refused.
    pub rejected: usize,
    /// Reminders deactivated because their rule ran out.
    pub exhausted: usize,
    /// Reminders that still failed after all retries.
    pub failed: Vec<ReminderId>,
    /// The walk over active reminders stopped early.
    pub incomplete: bool,
}

impl ReconcileReport {
    pub(crate) fn for_one() -> Self {
        Self {
            examined: 1,
            ..Self::default()
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: ReconcileReport) {
        self.examined += other.examined;
        self.armed += other.armed;
        self.rearmed += other.rearmed;
        self.delivered_late += other.delivered_late;
        self.missed += other.missed;
        self.cancelled += other.cancelled;
        self.rejected += other.rejected;
        self.exhausted += other.exhausted;
        self.failed.extend(other.failed);
        self.incomplete |= other.incomplete;
    }

    /// True when every reminder was reconciled.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.incomplete
    }
}
