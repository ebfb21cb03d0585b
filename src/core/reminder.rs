//! Reminder definitions and recurrence rules.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::schedule::ScheduleError;
use super::types::ReminderId;

/// A (weekday, local time) pair for weekly rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeeklySlot {
    pub weekday: Weekday,
    pub time: NaiveTime,
}

impl WeeklySlot {
    pub fn new(weekday: Weekday, time: NaiveTime) -> Self {
        Self { weekday, time }
    }
}

/// When a reminder fires.
///
/// `Daily` and `Weekly` are anchored to local wall-clock time; `Once` and
/// `Interval` are absolute instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceRule {
    /// Fires once at an absolute instant.
    Once { at: DateTime<Utc> },
    /// Fires every day at a local time.
    Daily { time: NaiveTime },
    /// Fires on each listed weekday at its local time.
    Weekly { slots: Vec<WeeklySlot> },
    /// Fires every `every_hours` hours starting at `start`.
    Interval {
        start: DateTime<Utc>,
        every_hours: u32,
    },
}

impl RecurrenceRule {
    /// One-shot rule.
    pub fn once(at: DateTime<Utc>) -> Self {
        RecurrenceRule::Once { at }
    }

    /// Daily rule at a local time.
    pub fn daily(time: NaiveTime) -> Self {
        RecurrenceRule::Daily { time }
    }

    /// Weekly rule. Duplicate slots are collapsed; an empty set is rejected.
    pub fn weekly(slots: impl IntoIterator<Item = WeeklySlot>) -> Result<Self, ScheduleError> {
        let mut unique: Vec<WeeklySlot> = Vec::new();
        for slot in slots {
            if !unique.contains(&slot) {
                unique.push(slot);
            }
        }
        let rule = RecurrenceRule::Weekly { slots: unique };
        rule.validate()?;
        Ok(rule)
    }

    /// Interval rule. `every_hours` must be at least 1.
    pub fn interval(start: DateTime<Utc>, every_hours: u32) -> Result<Self, ScheduleError> {
        let rule = RecurrenceRule::Interval { start, every_hours };
        rule.validate()?;
        Ok(rule)
    }

    /// Check the rule can produce occurrences at all.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            RecurrenceRule::Weekly { slots } if slots.is_empty() => Err(
                ScheduleError::InvalidRule("weekly rule needs at least one slot".into()),
            ),
            RecurrenceRule::Interval { every_hours: 0, .. } => Err(ScheduleError::InvalidRule(
                "interval must be at least one hour".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether more than one occurrence can ever exist.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, RecurrenceRule::Once { .. })
    }
}

/// A user-authored reminder: what to take and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderDefinition {
    /// Stable identifier, assigned at creation.
    pub id: ReminderId,
    /// Medication label shown in the notification.
    pub label: String,
    /// Free-form dose note.
    pub dose_note: String,
    /// Recurrence rule.
    pub rule: RecurrenceRule,
    /// Inactive reminders are never scheduled.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReminderDefinition {
    /// Create a new active reminder.
    pub fn new(
        label: impl Into<String>,
        dose_note: impl Into<String>,
        rule: RecurrenceRule,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReminderId::new(),
            label: label.into(),
            dose_note: dose_note.into(),
            rule,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the creation (and update) timestamp.
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Set the active flag.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Mark the reminder inactive.
    pub fn deactivate(&mut self, at: DateTime<Utc>) {
        self.active = false;
        self.updated_at = at;
    }
}
