//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use super::{ReminderStore, StorageError};
use crate::core::occurrence::{OccurrenceStatus, ScheduledOccurrence};
use crate::core::reminder::ReminderDefinition;
use crate::core::types::{OccurrenceId, ReminderId};

/// Occurrence rows plus the per-reminder history and latest-occurrence index,
/// kept under one lock so they always agree.
#[derive(Default)]
struct OccurrenceTables {
    rows: HashMap<OccurrenceId, ScheduledOccurrence>,
    history: HashMap<ReminderId, Vec<OccurrenceId>>,
    latest: HashMap<ReminderId, OccurrenceId>,
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    reminders: RwLock<BTreeMap<ReminderId, ReminderDefinition>>,
    occurrences: RwLock<OccurrenceTables>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            reminders: RwLock::new(BTreeMap::new()),
            occurrences: RwLock::new(OccurrenceTables::default()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReminderStore for InMemoryStorage {
    async fn put_reminder(&self, reminder: ReminderDefinition) -> Result<(), StorageError> {
        let mut reminders = self
            .reminders
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        reminders.insert(reminder.id, reminder);
        Ok(())
    }

    async fn get_reminder(
        &self,
        id: &ReminderId,
    ) -> Result<Option<ReminderDefinition>, StorageError> {
        let reminders = self
            .reminders
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(reminders.get(id).cloned())
    }

    async fn delete_reminder(&self, id: &ReminderId) -> Result<(), StorageError> {
        let mut reminders = self
            .reminders
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        reminders
            .remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("reminder: {}", id)))?;
        Ok(())
    }

    async fn list_active_after(
        &self,
        after: Option<&ReminderId>,
        limit: usize,
    ) -> Result<Vec<ReminderDefinition>, StorageError> {
        let reminders = self
            .reminders
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let lower = match after {
            Some(id) => Bound::Excluded(*id),
            None => Bound::Unbounded,
        };
        Ok(reminders
            .range((lower, Bound::Unbounded))
            .map(|(_, reminder)| reminder)
            .filter(|reminder| reminder.active)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_occurrence(&self, occurrence: ScheduledOccurrence) -> Result<(), StorageError> {
        let mut tables = self
            .occurrences
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if tables.rows.contains_key(&occurrence.id) {
            return Err(StorageError::DuplicateKey(format!(
                "occurrence: {}",
                occurrence.id
            )));
        }
        tables
            .history
            .entry(occurrence.reminder_id)
            .or_default()
            .push(occurrence.id);
        tables.latest.insert(occurrence.reminder_id, occurrence.id);
        tables.rows.insert(occurrence.id, occurrence);
        Ok(())
    }

    async fn get_occurrence(
        &self,
        id: &OccurrenceId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        let tables = self
            .occurrences
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.rows.get(id).cloned())
    }

    async fn latest_occurrence(
        &self,
        reminder_id: &ReminderId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        let tables = self
            .occurrences
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables
            .latest
            .get(reminder_id)
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    async fn list_occurrences(
        &self,
        reminder_id: &ReminderId,
    ) -> Result<Vec<ScheduledOccurrence>, StorageError> {
        let tables = self
            .occurrences
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables
            .history
            .get(reminder_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.rows.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_occurrence_status(
        &self,
        id: &OccurrenceId,
        status: OccurrenceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tables = self
            .occurrences
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let occurrence = tables
            .rows
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("occurrence: {}", id)))?;
        occurrence.transition(status, at);
        Ok(())
    }

    async fn mark_delivered(
        &self,
        id: &OccurrenceId,
        late: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tables = self
            .occurrences
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let occurrence = tables
            .rows
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("occurrence: {}", id)))?;
        occurrence.transition(OccurrenceStatus::Delivered, at);
        occurrence.delivered_late = late;
        Ok(())
    }
}
