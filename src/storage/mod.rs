//! Storage abstraction for persisting reminders and their occurrences.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::occurrence::{OccurrenceStatus, ScheduledOccurrence};
use crate::core::reminder::ReminderDefinition;
use crate::core::retry::Transient;
use crate::core::types::{OccurrenceId, ReminderId};

/// Page size used when walking active reminders.
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// The backend did not answer in time.
    #[error("storage timed out: {0}")]
    Timeout(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Timeout(_) | StorageError::LockPoisoned | StorageError::Other(_)
        )
    }
}

/// Durable store for reminder definitions and scheduled occurrences.
///
/// Every write must be durable before the call returns.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    // Reminder operations

    /// Insert or replace a reminder definition.
    async fn put_reminder(&self, reminder: ReminderDefinition) -> Result<(), StorageError>;

    /// Get a reminder by ID.
    async fn get_reminder(&self, id: &ReminderId)
    -> Result<Option<ReminderDefinition>, StorageError>;

    /// Delete a reminder definition. Its occurrence history is kept.
    async fn delete_reminder(&self, id: &ReminderId) -> Result<(), StorageError>;

    /// Active reminders with an id strictly greater than `after`, ordered by
    /// id. Returns at most `limit` reminders.
    async fn list_active_after(
        &self,
        after: Option<&ReminderId>,
        limit: usize,
    ) -> Result<Vec<ReminderDefinition>, StorageError>;

    /// Lazily walk all active reminders, one page at a time.
    fn list_active(&self, page_size: usize) -> ActiveReminders<'_, Self>
    where
        Self: Sized,
    {
        ActiveReminders::new(self, page_size)
    }

    // Occurrence operations

    /// Record a new occurrence and make it the reminder's latest one.
    async fn record_occurrence(&self, occurrence: ScheduledOccurrence) -> Result<(), StorageError>;

    /// Get an occurrence by ID.
    async fn get_occurrence(
        &self,
        id: &OccurrenceId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError>;

    /// The most recently recorded occurrence for a reminder.
    async fn latest_occurrence(
        &self,
        reminder_id: &ReminderId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError>;

    /// All occurrences for a reminder, oldest first.
    async fn list_occurrences(
        &self,
        reminder_id: &ReminderId,
    ) -> Result<Vec<ScheduledOccurrence>, StorageError>;

    /// Change an occurrence's status.
    async fn update_occurrence_status(
        &self,
        id: &OccurrenceId,
        status: OccurrenceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Mark an occurrence Delivered, recording whether it went out late.
    async fn mark_delivered(
        &self,
        id: &OccurrenceId,
        late: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

/// Restartable cursor over active reminders.
///
/// Pages are keyed by reminder id, so the walk is stable within one pass: no
/// duplicates and no omissions. The cursor only advances after a page is
/// fetched successfully, so a failed fetch can simply be retried.
pub struct ActiveReminders<'a, S: ReminderStore + ?Sized> {
    store: &'a S,
    cursor: Option<ReminderId>,
    page_size: usize,
    exhausted: bool,
}

impl<'a, S: ReminderStore + ?Sized> ActiveReminders<'a, S> {
    pub fn new(store: &'a S, page_size: usize) -> Self {
        Self {
            store,
            cursor: None,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    /// Fetch the next page, or `None` once every active reminder was seen.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ReminderDefinition>>, StorageError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .store
            .list_active_after(self.cursor.as_ref(), self.page_size)
            .await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.cursor = Some(last.id);
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    /// Start again from the first reminder.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.exhausted = false;
    }

    /// Id of the last reminder handed out.
    pub fn cursor(&self) -> Option<&ReminderId> {
        self.cursor.as_ref()
    }

    /// Drain every remaining page.
    pub async fn collect_all(&mut self) -> Result<Vec<ReminderDefinition>, StorageError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
