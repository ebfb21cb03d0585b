//! Scheduled occurrences and their status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{OccurrenceId, ReminderId};

/// Status of a scheduled occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OccurrenceStatus {
    /// Created but not yet accepted by the fire timer.
    Pending,
    /// The fire timer accepted the wake request.
    Armed,
    /// Handed to the presentation layer.
    Delivered,
    /// Elapsed without delivery, or the timer refused it.
    Missed,
    /// The reminder was deactivated, deleted or edited before firing.
    Cancelled,
}

impl OccurrenceStatus {
    /// Pending and Armed occurrences are still waiting to fire.
    pub fn is_open(self) -> bool {
        matches!(self, OccurrenceStatus::Pending | OccurrenceStatus::Armed)
    }

    /// Delivered, Missed and Cancelled never change again.
    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OccurrenceStatus::Pending => "pending",
            OccurrenceStatus::Armed => "armed",
            OccurrenceStatus::Delivered => "delivered",
            OccurrenceStatus::Missed => "missed",
            OccurrenceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OccurrenceStatus::Pending),
            "armed" => Some(OccurrenceStatus::Armed),
            "delivered" => Some(OccurrenceStatus::Delivered),
            "missed" => Some(OccurrenceStatus::Missed),
            "cancelled" => Some(OccurrenceStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for OccurrenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete, materialized instance of a reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledOccurrence {
    pub id: OccurrenceId,
    pub reminder_id: ReminderId,
    /// Absolute instant the occurrence should fire at.
    pub fire_at: DateTime<Utc>,
    pub status: OccurrenceStatus,
    /// Set when delivered by the catch-up path rather than on time.
    pub delivered_late: bool,
    /// The instant `fire_at` was computed as the next fire-time after.
    ///
    /// Usually the creation time. After a rejected wake request it is the
    /// rejected occurrence's fire-time, so the follow-up is still the
    /// expected one on the next pass.
    pub scheduled_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledOccurrence {
    /// Create a new Pending occurrence.
    pub fn new(reminder_id: ReminderId, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: OccurrenceId::new(),
            reminder_id,
            fire_at,
            status: OccurrenceStatus::Pending,
            delivered_late: false,
            scheduled_after: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the instant the fire-time was computed after.
    pub fn with_scheduled_after(mut self, after: DateTime<Utc>) -> Self {
        self.scheduled_after = after;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Move to a new status, stamping the update time.
    pub fn transition(&mut self, status: OccurrenceStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
    }
}
