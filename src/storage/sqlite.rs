//! SQLite storage implementation.
//!
//! Provides durable storage using a SQLite database in WAL mode with full
//! synchronous commits, so every write is on disk before the call returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;

use super::{ReminderStore, StorageError};
use crate::core::occurrence::{OccurrenceStatus, ScheduledOccurrence};
use crate::core::reminder::{RecurrenceRule, ReminderDefinition};
use crate::core::types::{OccurrenceId, ReminderId};

type ReminderRow = (String, String, String, String, bool, i64, i64);
type OccurrenceRow = (String, String, i64, String, bool, i64, i64, i64);

const REMINDER_COLUMNS: &str = "id, label, dose_note, rule, active, created_at, updated_at";
const OCCURRENCE_COLUMNS: &str =
    "id, reminder_id, fire_at, status, delivered_late, scheduled_after, created_at, updated_at";

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Instants are stored as nanoseconds so they compare equal to the ones
/// computed from a rule after a reload.
fn to_nanos(time: DateTime<Utc>) -> Result<i64, StorageError> {
    time.timestamp_nanos_opt()
        .ok_or_else(|| StorageError::SerializationError(format!("timestamp out of range: {}", time)))
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

fn parse_id<T: FromStr>(s: &str, what: &str) -> Result<T, StorageError>
where
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e| StorageError::SerializationError(format!("invalid {} id '{}': {}", what, s, e)))
}

fn reminder_from_row(row: ReminderRow) -> Result<ReminderDefinition, StorageError> {
    let rule: RecurrenceRule = serde_json::from_str(&row.3)
        .map_err(|e| StorageError::SerializationError(format!("invalid rule: {}", e)))?;
    Ok(ReminderDefinition {
        id: parse_id(&row.0, "reminder")?,
        label: row.1,
        dose_note: row.2,
        rule,
        active: row.4,
        created_at: from_nanos(row.5),
        updated_at: from_nanos(row.6),
    })
}

fn occurrence_from_row(row: OccurrenceRow) -> Result<ScheduledOccurrence, StorageError> {
    let status = OccurrenceStatus::parse(&row.3)
        .ok_or_else(|| StorageError::SerializationError(format!("invalid status: {}", row.3)))?;
    Ok(ScheduledOccurrence {
        id: parse_id(&row.0, "occurrence")?,
        reminder_id: parse_id(&row.1, "reminder")?,
        fire_at: from_nanos(row.2),
        status,
        delivered_late: row.4,
        scheduled_after: from_nanos(row.5),
        created_at: from_nanos(row.6),
        updated_at: from_nanos(row.7),
    })
}

#[async_trait]
impl ReminderStore for SqliteStorage {
    async fn put_reminder(&self, reminder: ReminderDefinition) -> Result<(), StorageError> {
        let rule = serde_json::to_string(&reminder.rule)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO reminders (id, label, dose_note, rule, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                label = excluded.label,
                dose_note = excluded.dose_note,
                rule = excluded.rule,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(reminder.id.to_string())
        .bind(&reminder.label)
        .bind(&reminder.dose_note)
        .bind(rule)
        .bind(reminder.active)
        .bind(to_nanos(reminder.created_at)?)
        .bind(to_nanos(reminder.updated_at)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn get_reminder(
        &self,
        id: &ReminderId,
    ) -> Result<Option<ReminderDefinition>, StorageError> {
        let row: Option<ReminderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reminders WHERE id = ?",
            REMINDER_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        row.map(reminder_from_row).transpose()
    }

    async fn delete_reminder(&self, id: &ReminderId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM reminders WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("reminder: {}", id)));
        }
        Ok(())
    }

    async fn list_active_after(
        &self,
        after: Option<&ReminderId>,
        limit: usize,
    ) -> Result<Vec<ReminderDefinition>, StorageError> {
        // Every id string sorts after the empty string.
        let cursor = after.map(|id| id.to_string()).unwrap_or_default();
        let rows: Vec<ReminderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reminders WHERE active = 1 AND id > ? ORDER BY id LIMIT ?",
            REMINDER_COLUMNS
        ))
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(reminder_from_row).collect()
    }

    async fn record_occurrence(&self, occurrence: ScheduledOccurrence) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO occurrences (id, reminder_id, fire_at, status, delivered_late, scheduled_after, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(occurrence.id.to_string())
        .bind(occurrence.reminder_id.to_string())
        .bind(to_nanos(occurrence.fire_at)?)
        .bind(occurrence.status.as_str())
        .bind(occurrence.delivered_late)
        .bind(to_nanos(occurrence.scheduled_after)?)
        .bind(to_nanos(occurrence.created_at)?)
        .bind(to_nanos(occurrence.updated_at)?)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StorageError::DuplicateKey(format!(
                    "occurrence: {}",
                    occurrence.id
                )));
            }
            Err(e) => return Err(StorageError::Other(e.to_string())),
        }

        sqlx::query(
            r#"
            INSERT INTO latest_occurrences (reminder_id, occurrence_id)
            VALUES (?, ?)
            ON CONFLICT(reminder_id) DO UPDATE SET occurrence_id = excluded.occurrence_id
            "#,
        )
        .bind(occurrence.reminder_id.to_string())
        .bind(occurrence.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn get_occurrence(
        &self,
        id: &OccurrenceId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        let row: Option<OccurrenceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM occurrences WHERE id = ?",
            OCCURRENCE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        row.map(occurrence_from_row).transpose()
    }

    async fn latest_occurrence(
        &self,
        reminder_id: &ReminderId,
    ) -> Result<Option<ScheduledOccurrence>, StorageError> {
        let row: Option<OccurrenceRow> = sqlx::query_as(
            r#"
            SELECT o.id, o.reminder_id, o.fire_at, o.status, o.delivered_late, o.scheduled_after, o.created_at, o.updated_at
            FROM latest_occurrences l
            JOIN occurrences o ON o.id = l.occurrence_id
            WHERE l.reminder_id = ?
            "#,
        )
        .bind(reminder_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        row.map(occurrence_from_row).transpose()
    }

    async fn list_occurrences(
        &self,
        reminder_id: &ReminderId,
    ) -> Result<Vec<ScheduledOccurrence>, StorageError> {
        let rows: Vec<OccurrenceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM occurrences WHERE reminder_id = ? ORDER BY seq",
            OCCURRENCE_COLUMNS
        ))
        .bind(reminder_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(occurrence_from_row).collect()
    }

    async fn update_occurrence_status(
        &self,
        id: &OccurrenceId,
        status: OccurrenceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE occurrences SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(to_nanos(at)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("occurrence: {}", id)));
        }
        Ok(())
    }

    async fn mark_delivered(
        &self,
        id: &OccurrenceId,
        late: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE occurrences SET status = ?, delivered_late = ?, updated_at = ? WHERE id = ?",
        )
        .bind(OccurrenceStatus::Delivered.as_str())
        .bind(late)
        .bind(to_nanos(at)?)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("occurrence: {}", id)));
        }
        Ok(())
    }
}
