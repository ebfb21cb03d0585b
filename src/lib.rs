pub mod config;
pub mod core;
pub mod delivery;
pub mod events;
pub mod scheduler;
pub mod storage;
pub mod testing;
pub mod timer;

pub use config::{ConfigError, EngineConfig, RetryConfig};
pub use core::clock::{Clock, SystemClock};
pub use core::occurrence::{OccurrenceStatus, ScheduledOccurrence};
pub use core::reminder::{RecurrenceRule, ReminderDefinition, WeeklySlot};
pub use core::retry::{RetryCondition, RetryPolicy, Transient};
pub use core::schedule::{ScheduleCalculator, ScheduleError};
pub use core::types::{OccurrenceId, ReminderId};
pub use delivery::{
    DeliveryHandler, DeliveryOutcome, LogPresenter, PresentError, Presentation, Presenter,
    spawn_callback_loop,
};
pub use events::{Event, EventBus, EventHandler};
pub use scheduler::{
    BootRecovery, ColdStartRecovery, EngineSettings, PermissionRestoredRecovery, ReconcileReport,
    RecoveryOutcome, RecoverySource, RecoveryTrigger, ReminderLocks, SchedulerError,
    SchedulingEngine,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{ActiveReminders, InMemoryStorage, ReminderStore, StorageError};
pub use timer::{Armed, FireCallbacks, FireTimer, TimerRejection, TokioFireTimer};
