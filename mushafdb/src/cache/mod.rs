//! Process-wide cache of collection contents.
//!
//! One entry per collection holding the last known records and the remote
//! revision metadata. Optimistic writes replace the records immediately and
//! count as pending until the write queue settles them; while a collection
//! has pending writes a refresh only tracks the remote revision id and keeps
//! the optimistic records.
//!
//! Each entry carries a generation. A failed write bumps it and marks the
//! entry stale, so snapshots taken on top of the failed write can no longer
//! be applied and the next read goes back to the remote store.

use crate::config::StoreConfig;
use crate::error::Result;
use crate::record::Record;
use crate::remote::{FetchOutcome, RemoteStore};
use crate::watcher::ListenerRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub records: Vec<Record>,
    /// ETag of the fetched content; cleared by optimistic writes.
    pub revision_tag: Option<String>,
    /// Revision id of the remote file, `None` while the file does not exist.
    pub revision_id: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub pending_writes: usize,
    /// Bumped each time a failed write invalidates the optimistic records.
    pub generation: u64,
    /// Set by a rollback until fresh remote content has been applied.
    pub stale: bool,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            revision_tag: None,
            revision_id: None,
            last_updated: Utc::now(),
            pending_writes: 0,
            generation: 0,
            stale: false,
        }
    }
}

/// Records as seen by a caller about to compute a write, with the
/// generation they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub records: Vec<Record>,
    pub generation: u64,
}

/// Result of a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Refreshed {
    pub records: Vec<Record>,
    /// False when the remote file does not exist.
    pub exists: bool,
    /// True when new content replaced the cached records.
    pub changed: bool,
    pub revision_id: Option<String>,
    pub generation: u64,
}

pub struct CollectionCache {
    remote: Arc<dyn RemoteStore>,
    config: Arc<StoreConfig>,
    listeners: Arc<ListenerRegistry>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CollectionCache {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        config: Arc<StoreConfig>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            remote,
            config,
            listeners,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn listeners(&self) -> Arc<ListenerRegistry> {
        Arc::clone(&self.listeners)
    }

    pub fn remote(&self) -> Arc<dyn RemoteStore> {
        Arc::clone(&self.remote)
    }

    pub fn path(&self, collection: &str) -> String {
        self.config.collection_path(collection)
    }

    /// Cached records, going to the remote store when `force` is set or nothing is cached.
    pub async fn read(&self, collection: &str, force: bool) -> Result<Vec<Record>> {
        Ok(self.snapshot(collection, force).await?.records)
    }

    /// Like [`CollectionCache::read`], also returning the entry generation.
    /// A stale entry is always refetched.
    pub async fn snapshot(&self, collection: &str, force: bool) -> Result<Snapshot> {
        if !force {
            let cached = self
                .lock()
                .get(collection)
                .filter(|e| !e.stale)
                .map(|e| Snapshot {
                    records: e.records.clone(),
                    generation: e.generation,
                });
            if let Some(snapshot) = cached {
                return Ok(snapshot);
            }
        }
        let refreshed = self.refresh(collection).await?;
        Ok(Snapshot {
            records: refreshed.records,
            generation: refreshed.generation,
        })
    }

    /// Conditional fetch of the collection file.
    ///
    /// Listeners are notified when new content replaces the cached records.
    pub async fn refresh(&self, collection: &str) -> Result<Refreshed> {
        let path = self.path(collection);
        let tag = self.lock().get(collection).and_then(|e| e.revision_tag.clone());

        let mut outcome = self.remote.fetch(&path, tag.as_deref()).await?;
        let cached = self.lock().contains_key(collection);
        if matches!(outcome, FetchOutcome::NotModified) && !cached {
            outcome = self.remote.fetch(&path, None).await?;
        }

        let refreshed = {
            let mut entries = self.lock();
            let entry = entries.entry(collection.to_string()).or_insert_with(CacheEntry::empty);
            apply_outcome(entry, outcome)
        };

        if refreshed.changed {
            log::debug!("Refreshed '{collection}' ({} records)", refreshed.records.len());
            self.listeners.notify(collection, &refreshed.records);
        }
        Ok(refreshed)
    }

    /// Replace the cached records ahead of durability and notify listeners.
    ///
    /// Returns false, leaving the entry untouched, when `generation` is no
    /// longer current.
    pub fn optimistic_write(&self, collection: &str, generation: u64, records: &[Record]) -> bool {
        {
            let mut entries = self.lock();
            let entry = entries
                .entry(collection.to_string())
                .or_insert_with(CacheEntry::empty);
            if entry.generation != generation || entry.stale {
                return false;
            }
            entry.records = records.to_vec();
            entry.revision_tag = None;
            entry.last_updated = Utc::now();
            entry.pending_writes += 1;
        }
        self.listeners.notify(collection, records);
        true
    }

    pub fn generation(&self, collection: &str) -> u64 {
        self.lock().get(collection).map_or(0, |e| e.generation)
    }

    /// Discard the optimistic records of `collection` after a failed write.
    ///
    /// Writes still queued against the old generation will be rejected. The
    /// remote content is fetched again; if that fails the entry stays stale
    /// and the next read retries.
    pub async fn rollback(&self, collection: &str) -> Result<Refreshed> {
        {
            let mut entries = self.lock();
            let entry = entries
                .entry(collection.to_string())
                .or_insert_with(CacheEntry::empty);
            entry.generation += 1;
            entry.stale = true;
            entry.revision_tag = None;
        }
        self.refresh(collection).await
    }

    /// Mark one pending write of `collection` as finished, successfully or not.
    pub fn settle(&self, collection: &str) {
        if let Some(entry) = self.lock().get_mut(collection) {
            entry.pending_writes = entry.pending_writes.saturating_sub(1);
        }
    }

    pub fn entry(&self, collection: &str) -> Option<CacheEntry> {
        self.lock().get(collection).cloned()
    }

    /// Names of every collection with a cache entry, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

fn apply_outcome(entry: &mut CacheEntry, outcome: FetchOutcome) -> Refreshed {
    let keep_optimistic = entry.pending_writes > 0 && !entry.stale;
    let mut changed = false;
    let exists;

    match outcome {
        FetchOutcome::NotModified => {
            exists = true;
        }
        FetchOutcome::NotFound => {
            exists = false;
            entry.revision_tag = None;
            entry.revision_id = None;
            if !keep_optimistic && !entry.records.is_empty() {
                entry.records.clear();
                changed = true;
            }
            entry.stale = false;
            entry.last_updated = Utc::now();
        }
        FetchOutcome::Found(file) => {
            exists = true;
            entry.revision_id = Some(file.revision_id);
            if !keep_optimistic {
                entry.records = file.records;
                entry.revision_tag = file.revision_tag;
                entry.stale = false;
                changed = true;
            }
            entry.last_updated = Utc::now();
        }
    }

    Refreshed {
        records: entry.records.clone(),
        exists,
        changed,
        revision_id: entry.revision_id.clone(),
        generation: entry.generation,
    }
}
