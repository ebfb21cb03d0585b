//! In-process fire timer backed by tokio timers.
//!
//! Wake requests are tokio tasks that sleep until their instant and then push
//! the occurrence id onto a channel. Requests do not outlive the process; the
//! recovery triggers re-arm everything from storage after a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Armed, FireTimer, TimerRejection};
use crate::core::clock::{Clock, SystemClock};
use crate::core::types::OccurrenceId;

/// Receiving side of the timer's callback surface.
pub struct FireCallbacks {
    rx: mpsc::UnboundedReceiver<OccurrenceId>,
}

impl FireCallbacks {
    /// Wait for the next fired occurrence. Returns `None` once the timer is
    /// dropped and every pending callback was received.
    pub async fn recv(&mut self) -> Option<OccurrenceId> {
        self.rx.recv().await
    }
}

/// Fire timer that wakes via `tokio::time::sleep`.
pub struct TokioFireTimer {
    pending: Mutex<HashMap<OccurrenceId, JoinHandle<()>>>,
    callbacks: mpsc::UnboundedSender<OccurrenceId>,
    permitted: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl TokioFireTimer {
    /// Create a timer on the system clock and its callback receiver.
    pub fn new() -> (Self, FireCallbacks) {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a timer that measures delays against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> (Self, FireCallbacks) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = Self {
            pending: Mutex::new(HashMap::new()),
            callbacks: tx,
            permitted: AtomicBool::new(true),
            clock,
        };
        (timer, FireCallbacks { rx })
    }

    /// Grant or revoke background wake permission. Revoking does not
    /// cancel requests that were already accepted.
    pub fn set_permission(&self, permitted: bool) {
        self.permitted.store(permitted, Ordering::SeqCst);
    }

    /// Number of requests that have not fired yet.
    pub fn armed_count(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FireTimer for TokioFireTimer {
    async fn arm(
        &self,
        occurrence_id: OccurrenceId,
        at: DateTime<Utc>,
    ) -> Result<Armed, TimerRejection> {
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(TimerRejection::PermissionDenied);
        }
        let now = self.clock.now();
        let delay = (at - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or(TimerRejection::InPast(at))?;

        let tx = self.callbacks.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(occurrence_id).is_err() {
                tracing::debug!(occurrence_id = %occurrence_id, "Fire callback receiver dropped");
            }
        });

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| TimerRejection::Platform("timer lock poisoned".into()))?;
        pending.retain(|_, h| !h.is_finished());
        if let Some(previous) = pending.insert(occurrence_id, handle) {
            previous.abort();
        }

        Ok(Armed { occurrence_id, at })
    }

    async fn cancel(&self, occurrence_id: OccurrenceId) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(handle) = pending.remove(&occurrence_id) {
                handle.abort();
            }
        }
    }
}

impl Drop for TokioFireTimer {
    fn drop(&mut self) {
        if let Ok(pending) = self.pending.get_mut() {
            for handle in pending.values() {
                handle.abort();
            }
        }
    }
}
