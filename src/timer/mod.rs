//! Platform wake-up primitive.
//!
//! A [`FireTimer`] is asked to call back with an [`OccurrenceId`] at or after
//! a given instant. Callbacks may be late, may be duplicated, and survive
//! process death but not power-off; the callback side is a message boundary
//! that carries nothing but the id.

mod tokio_timer;

pub use tokio_timer::{FireCallbacks, TokioFireTimer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::types::OccurrenceId;

/// Acknowledgement that a wake request was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armed {
    pub occurrence_id: OccurrenceId,
    pub at: DateTime<Utc>,
}

/// Reasons the platform refused a wake request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerRejection {
    /// The requested instant has already passed.
    #[error("requested instant {0} is in the past")]
    InPast(DateTime<Utc>),

    /// Background wake-ups are not permitted.
    #[error("background wake permission denied")]
    PermissionDenied,

    /// The platform did not answer in time.
    #[error("timer request timed out")]
    Timeout,

    /// Any other platform refusal.
    #[error("platform rejected wake request: {0}")]
    Platform(String),
}

/// Abstraction over the platform's ability to wake the app at an instant.
#[async_trait]
pub trait FireTimer: Send + Sync {
    /// Request a callback for `occurrence_id` at or after `at`.
    ///
    /// Re-arming the same id replaces the earlier request.
    async fn arm(&self, occurrence_id: OccurrenceId, at: DateTime<Utc>)
    -> Result<Armed, TimerRejection>;

    /// Withdraw a wake request. Unknown ids are ignored.
    async fn cancel(&self, occurrence_id: OccurrenceId);
}
