//! Recovery entry points.
//!
//! Every way the process can come back (device boot, cold start, background
//! wake permission being granted again) funnels into the same full
//! reconciliation pass. The pass runs on its own task; a trigger waits for it
//! up to a time budget and otherwise lets it finish in the background, so a
//! pass is never abandoned half-applied.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::engine::SchedulingEngine;
use super::types::{ReconcileReport, SchedulerError};
use crate::storage::ReminderStore;
use crate::timer::FireTimer;

/// Platform broadcasts that mean the device just booted.
pub const BOOT_ACTIONS: [&str; 3] = [
    "android.intent.action.BOOT_COMPLETED",
    "android.intent.action.QUICKBOOT_POWERON",
    "com.htc.intent.action.QUICKBOOT_POWERON",
];

/// Default time a trigger waits for its pass before deferring it.
pub const DEFAULT_RECOVERY_BUDGET: Duration = Duration::from_secs(10);

/// What caused a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoverySource {
    DeviceBoot,
    ColdStart,
    PermissionRestored,
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoverySource::DeviceBoot => "device_boot",
            RecoverySource::ColdStart => "cold_start",
            RecoverySource::PermissionRestored => "permission_restored",
        };
        f.write_str(name)
    }
}

/// Result of a recovery trigger.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// The pass finished within the budget.
    Completed(ReconcileReport),
    /// The pass is still running; await the handle for its report.
    Deferred(JoinHandle<ReconcileReport>),
    /// The pass task died before reporting.
    Failed(SchedulerError),
}

impl RecoveryOutcome {
    /// Wait for the report, whether or not the pass was deferred.
    pub async fn into_report(self) -> Result<ReconcileReport, SchedulerError> {
        match self {
            RecoveryOutcome::Completed(report) => Ok(report),
            RecoveryOutcome::Deferred(handle) => handle
                .await
                .map_err(|e| SchedulerError::Task(e.to_string())),
            RecoveryOutcome::Failed(e) => Err(e),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, RecoveryOutcome::Deferred(_))
    }
}

/// Something that starts a full reconciliation pass.
#[async_trait]
pub trait RecoveryTrigger: Send + Sync {
    /// Where this trigger comes from.
    fn source(&self) -> RecoverySource;

    /// Run a reconciliation pass.
    async fn recover(&self) -> RecoveryOutcome;
}

/// Spawn `reconcile_all` and wait for it up to `budget`.
async fn run_pass<S, T>(
    engine: &SchedulingEngine<S, T>,
    source: RecoverySource,
    budget: Duration,
) -> RecoveryOutcome
where
    S: ReminderStore + 'static,
    T: FireTimer + 'static,
{
    tracing::info!(source = %source, "Starting recovery pass");
    let engine = engine.clone();
    let mut handle = tokio::spawn(async move { engine.reconcile_all().await });

    match tokio::time::timeout(budget, &mut handle).await {
        Ok(Ok(report)) => RecoveryOutcome::Completed(report),
        Ok(Err(e)) => {
            tracing::error!(source = %source, error = %e, "Recovery pass task failed");
            RecoveryOutcome::Failed(SchedulerError::Task(e.to_string()))
        }
        Err(_) => {
            tracing::warn!(
                source = %source,
                budget_ms = budget.as_millis() as u64,
                "Recovery pass exceeded its budget, continuing in background"
            );
            RecoveryOutcome::Deferred(handle)
        }
    }
}

macro_rules! recovery_trigger {
    ($(#[$meta:meta])* $name:ident, $source:expr) => {
        $(#[$meta])*
        pub struct $name<S: ReminderStore, T: FireTimer> {
            engine: SchedulingEngine<S, T>,
            budget: Duration,
        }

        impl<S: ReminderStore + 'static, T: FireTimer + 'static> $name<S, T> {
            pub fn new(engine: SchedulingEngine<S, T>) -> Self {
                Self {
                    engine,
                    budget: DEFAULT_RECOVERY_BUDGET,
                }
            }

            /// Set how long `recover` waits before deferring the pass.
            pub fn with_budget(mut self, budget: Duration) -> Self {
                self.budget = budget;
                self
            }
        }

        #[async_trait]
        impl<S: ReminderStore + 'static, T: FireTimer + 'static> RecoveryTrigger for $name<S, T> {
            fn source(&self) -> RecoverySource {
                $source
            }

            async fn recover(&self) -> RecoveryOutcome {
                run_pass(&self.engine, $source, self.budget).await
            }
        }
    };
}

recovery_trigger!(
    /// Re-arms everything after the device boots. Wake requests do not
    /// survive power-off.
    BootRecovery,
    RecoverySource::DeviceBoot
);

recovery_trigger!(
    /// Runs when the app process starts, covering boots whose broadcast
    /// never arrived.
    ColdStartRecovery,
    RecoverySource::ColdStart
);

recovery_trigger!(
    /// Runs when background wake permission is granted again.
    PermissionRestoredRecovery,
    RecoverySource::PermissionRestored
);

impl<S: ReminderStore + 'static, T: FireTimer + 'static> BootRecovery<S, T> {
    /// Whether `action` is one of the boot broadcasts.
    pub fn matches_action(action: &str) -> bool {
        BOOT_ACTIONS.contains(&action)
    }

    /// Entry point for a platform broadcast. Returns `None` for actions that
    /// are not boot broadcasts.
    pub async fn handle_broadcast(&self, action: &str) -> Option<RecoveryOutcome> {
        if !Self::matches_action(action) {
            tracing::debug!(action, "Ignoring non-boot broadcast");
            return None;
        }
        Some(self.recover().await)
    }
}
