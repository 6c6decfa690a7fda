//! # Per-Record Locks
//!
//! Serializes orchestrator work on the same record: an outbound push holds
//! the record's lock from the remote call through acknowledgement, and an
//! inbound apply for the same record waits for it. Different records never
//! contend.
//!
//! Entries are created on demand and removed when the last holder or waiter
//! drops its guard, so the table only holds records with activity in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type RecordKey = (String, String);

/// Table of async locks keyed by (model name, record id).
#[derive(Debug, Clone, Default)]
pub struct RecordLocks {
    table: Arc<Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>>,
}

/// Holds one record's lock until dropped.
#[derive(Debug)]
pub struct RecordGuard {
    key: RecordKey,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to one record.
    pub async fn lock(&self, model_name: &str, id: &str) -> RecordGuard {
        let key = (model_name.to_string(), id.to_string());
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entry(key.clone()).or_default().clone()
        };

        let guard = lock.clone().lock_owned().await;
        RecordGuard {
            key,
            lock,
            guard: Some(guard),
            table: self.table.clone(),
        }
    }

    /// Number of records with a holder or waiter.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        // Release before checking for waiters.
        self.guard.take();

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.key);
        }
    }
}
