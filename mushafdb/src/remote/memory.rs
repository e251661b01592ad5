use super::{FetchOutcome, RemoteError, RemoteFile, RemoteStore, WriteReceipt, WriteRequest};
use crate::record::Record;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredFile {
    records: Vec<Record>,
    revision: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<String, StoredFile>,
    next_revision: u64,
    fetches: HashMap<String, usize>,
    write_attempts: HashMap<String, usize>,
    write_failures: VecDeque<RemoteError>,
    fetch_failures: VecDeque<RemoteError>,
}

impl MemoryState {
    fn bump_revision(&mut self) -> String {
        self.next_revision += 1;
        format!("rev-{}", self.next_revision)
    }
}

/// In-process remote store with the same revision rules as the real backend.
///
/// Writes to an existing path must name its current revision; creating a path
/// must name none. Failures can be scripted, and the store records how many
/// fetches and write attempts each path saw and the highest number of writes
/// that were ever in progress at once.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    write_latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write take this long, so overlapping writes would be observable.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace a file's content as another actor would, bumping its revision.
    pub fn put_file(&self, path: &str, records: Vec<Record>) {
        let mut state = self.state();
        let revision = state.bump_revision();
        state
            .files
            .insert(path.to_string(), StoredFile { records, revision });
    }

    pub fn remove_file(&self, path: &str) {
        self.state().files.remove(path);
    }

    pub fn records(&self, path: &str) -> Option<Vec<Record>> {
        self.state().files.get(path).map(|f| f.records.clone())
    }

    pub fn revision(&self, path: &str) -> Option<String> {
        self.state().files.get(path).map(|f| f.revision.clone())
    }

    /// Fail the next `count` write attempts (any path) with `error`.
    pub fn fail_next_writes(&self, count: usize, error: RemoteError) {
        let mut state = self.state();
        for _ in 0..count {
            state.write_failures.push_back(error.clone());
        }
    }

    /// Fail the next `count` fetches (any path) with `error`.
    pub fn fail_next_fetches(&self, count: usize, error: RemoteError) {
        let mut state = self.state();
        for _ in 0..count {
            state.fetch_failures.push_back(error.clone());
        }
    }

    pub fn fetch_count(&self, path: &str) -> usize {
        self.state().fetches.get(path).copied().unwrap_or(0)
    }

    pub fn write_attempts(&self, path: &str) -> usize {
        self.state().write_attempts.get(path).copied().unwrap_or(0)
    }

    pub fn total_write_attempts(&self) -> usize {
        self.state().write_attempts.values().sum()
    }

    pub fn max_in_flight_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn apply_write(&self, request: &WriteRequest<'_>) -> Result<WriteReceipt, RemoteError> {
        let mut state = self.state();
        *state
            .write_attempts
            .entry(request.path.to_string())
            .or_default() += 1;

        if let Some(err) = state.write_failures.pop_front() {
            return Err(err);
        }

        let current = state.files.get(request.path).map(|f| f.revision.clone());
        if current.as_deref() != request.expected_revision {
            return Err(RemoteError::Conflict {
                path: request.path.to_string(),
            });
        }

        let revision = state.bump_revision();
        state.files.insert(
            request.path.to_string(),
            StoredFile {
                records: request.records.to_vec(),
                revision: revision.clone(),
            },
        );
        Ok(WriteReceipt {
            revision_id: Some(revision),
        })
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(
        &self,
        path: &str,
        if_none_match: Option<&str>,
    ) -> Result<FetchOutcome, RemoteError> {
        let mut state = self.state();
        *state.fetches.entry(path.to_string()).or_default() += 1;

        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }

        let Some(file) = state.files.get(path) else {
            return Ok(FetchOutcome::NotFound);
        };
        let tag = format!("\"{}\"", file.revision);
        if if_none_match == Some(tag.as_str()) {
            return Ok(FetchOutcome::NotModified);
        }
        Ok(FetchOutcome::Found(RemoteFile {
            records: file.records.clone(),
            revision_tag: Some(tag),
            revision_id: file.revision.clone(),
        }))
    }

    async fn write(&self, request: WriteRequest<'_>) -> Result<WriteReceipt, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.write_latency {
            tokio::time::sleep(latency).await;
        }
        let result = self.apply_write(&request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
