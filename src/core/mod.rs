//! Core domain types: identifiers, reminders, occurrences, schedules.

pub mod clock;
pub mod occurrence;
pub mod reminder;
pub mod retry;
pub mod schedule;
pub mod types;
