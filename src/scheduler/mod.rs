//! Scheduling engine and recovery.
//!
//! This module reconciles persisted reminders into armed occurrences and
//! provides the entry points that run reconciliation after a restart.

mod engine;
mod locks;
mod recovery;
mod types;

pub use engine::SchedulingEngine;
pub use locks::ReminderLocks;
pub use recovery::{
    BOOT_ACTIONS, BootRecovery, ColdStartRecovery, DEFAULT_RECOVERY_BUDGET,
    PermissionRestoredRecovery, RecoveryOutcome, RecoverySource, RecoveryTrigger,
};
pub use types::{EngineSettings, ReconcileReport, SchedulerError};
