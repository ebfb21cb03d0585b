//! Wall-clock source.
//!
//! Everything that compares against "now" reads it through [`Clock`] so
//! recovery after a reboot or a clock change can be replayed in tests.

use chrono::{DateTime, Utc};

/// Source of the current wall-clock instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The host's real-time clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
