//! Per-reminder mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::types::ReminderId;

/// Serializes every store mutation for one reminder id.
///
/// Different ids never block each other. Entries nobody holds or waits on
/// are pruned the next time a lock is taken.
#[derive(Clone, Default)]
pub struct ReminderLocks {
    inner: Arc<Mutex<HashMap<ReminderId, Arc<AsyncMutex<()>>>>>,
}

impl ReminderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: ReminderId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|key, m| *key == id || Arc::strong_count(m) > 1);
            Arc::clone(map.entry(id).or_default())
        };
        mutex.lock_owned().await
    }

    /// Number of ids with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
