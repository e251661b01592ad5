//! In-memory audit trail of record mutations, bounded per collection.

use crate::record::Record;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const AUDIT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub record: Record,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<HashMap<String, VecDeque<AuditEntry>>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(AUDIT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<AuditEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry, dropping the oldest once the collection is at capacity.
    /// A zero-capacity log keeps nothing.
    pub fn record(&self, collection: &str, action: AuditAction, record: &Record) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock();
        let log = entries.entry(collection.to_string()).or_default();
        while log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(AuditEntry {
            action,
            record: record.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Entries for `collection`, oldest first.
    pub fn for_collection(&self, collection: &str) -> Vec<AuditEntry> {
        self.lock()
            .get(collection)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<String, Vec<AuditEntry>> {
        self.lock()
            .iter()
            .map(|(name, log)| (name.clone(), log.iter().cloned().collect()))
            .collect()
    }
}
