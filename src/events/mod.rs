//! Lifecycle events and event handling.
//!
//! This module provides event emission for occurrence and reminder lifecycle
//! transitions, enabling observability into scheduling and delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::types::{OccurrenceId, ReminderId};
use crate::timer::TimerRejection;

/// Lifecycle events emitted by the engine and the delivery handler.
#[derive(Debug, Clone)]
pub enum Event {
    /// The fire timer accepted a wake request.
    OccurrenceArmed {
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        fire_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// An occurrence was presented to the user.
    OccurrenceDelivered {
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        /// Delivered by the catch-up path rather than on time.
        late: bool,
        timestamp: DateTime<Utc>,
    },

    /// An occurrence elapsed without being delivered.
    OccurrenceMissed {
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        fire_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// An open occurrence was withdrawn.
    OccurrenceCancelled {
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        timestamp: DateTime<Utc>,
    },

    /// The platform refused to arm an occurrence.
    TimerRejected {
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        reason: TimerRejection,
        timestamp: DateTime<Utc>,
    },

    /// A reminder has no further fire-times and was switched off.
    ReminderDeactivated {
        reminder_id: ReminderId,
        timestamp: DateTime<Utc>,
    },

    /// A full reconciliation pass finished.
    ReconcileCompleted {
        examined: usize,
        armed: usize,
        failed: usize,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::OccurrenceArmed { timestamp, .. } => *timestamp,
            Event::OccurrenceDelivered { timestamp, .. } => *timestamp,
            Event::OccurrenceMissed { timestamp, .. } => *timestamp,
            Event::OccurrenceCancelled { timestamp, .. } => *timestamp,
            Event::TimerRejected { timestamp, .. } => *timestamp,
            Event::ReminderDeactivated { timestamp, .. } => *timestamp,
            Event::ReconcileCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// The reminder this event concerns, if any.
    pub fn reminder_id(&self) -> Option<ReminderId> {
        match self {
            Event::OccurrenceArmed { reminder_id, .. }
            | Event::OccurrenceDelivered { reminder_id, .. }
            | Event::OccurrenceMissed { reminder_id, .. }
            | Event::OccurrenceCancelled { reminder_id, .. }
            | Event::TimerRejected { reminder_id, .. }
            | Event::ReminderDeactivated { reminder_id, .. } => Some(*reminder_id),
            Event::ReconcileCompleted { .. } => None,
        }
    }

    /// Create an OccurrenceArmed event.
    pub fn armed(
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        fire_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event::OccurrenceArmed {
            reminder_id,
            occurrence_id,
            fire_at,
            timestamp,
        }
    }

    /// Create an OccurrenceDelivered event.
    pub fn delivered(
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        late: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event::OccurrenceDelivered {
            reminder_id,
            occurrence_id,
            late,
            timestamp,
        }
    }

    /// Create an OccurrenceMissed event.
    pub fn missed(
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        fire_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event::OccurrenceMissed {
            reminder_id,
            occurrence_id,
            fire_at,
            timestamp,
        }
    }

    /// Create an OccurrenceCancelled event.
    pub fn cancelled(
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event::OccurrenceCancelled {
            reminder_id,
            occurrence_id,
            timestamp,
        }
    }

    /// Create a TimerRejected event.
    pub fn timer_rejected(
        reminder_id: ReminderId,
        occurrence_id: OccurrenceId,
        reason: TimerRejection,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event::TimerRejected {
            reminder_id,
            occurrence_id,
            reason,
            timestamp,
        }
    }

    /// Create a ReminderDeactivated event.
    pub fn deactivated(reminder_id: ReminderId, timestamp: DateTime<Utc>) -> Self {
        Event::ReminderDeactivated {
            reminder_id,
            timestamp,
        }
    }

    /// Create a ReconcileCompleted event.
    pub fn reconcile_completed(
        examined: usize,
        armed: usize,
        failed: usize,
        duration: Duration,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event::ReconcileCompleted {
            examined,
            armed,
            failed,
            duration,
            timestamp,
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
