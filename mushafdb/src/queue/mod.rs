//! Global write queue.
//!
//! Every collection write goes through one background task, so at most one
//! write is in flight at any time across all collections. A write carries the
//! complete desired record list; each attempt re-reads the current revision id
//! and writes against it. Retryable failures (conflicts, transient
//! unavailability) are repeated after a short delay up to the configured
//! budget.
//!
//! A write that fails for good rolls the cache back, and writes still queued
//! for the same collection that were computed on top of it are rejected
//! instead of persisting the failed change.

use crate::cache::CollectionCache;
use crate::config::RetryConfig;
use crate::error::{MushafDbError, Result};
use crate::record::Record;
use crate::remote::{RemoteError, WriteRequest};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

struct WriteJob {
    collection: String,
    generation: u64,
    records: Vec<Record>,
    enqueued_at: DateTime<Utc>,
    reply: oneshot::Sender<Result<Vec<Record>>>,
}

/// Completion handle of a queued write.
#[derive(Debug)]
pub struct PendingWrite {
    collection: String,
    rx: oneshot::Receiver<Result<Vec<Record>>>,
}

impl PendingWrite {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Wait until the write is committed or has failed for good.
    pub async fn wait(self) -> Result<Vec<Record>> {
        self.rx.await.map_err(|_| MushafDbError::QueueClosed)?
    }
}

pub struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteJob>,
    cache: Arc<CollectionCache>,
    length: Arc<AtomicUsize>,
}

impl WriteQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    ///
    /// The worker drains every queued write before exiting once the queue is dropped.
    pub fn start(cache: Arc<CollectionCache>, retry: RetryConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let length = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_worker(
            rx,
            Arc::clone(&cache),
            retry,
            Arc::clone(&length),
        ));
        Self { tx, cache, length }
    }

    /// Apply `records` optimistically to the cache and queue them for persistence.
    ///
    /// `generation` is the cache generation the records were computed from; a
    /// rollback since then rejects the write.
    pub fn enqueue(
        &self,
        collection: &str,
        generation: u64,
        records: Vec<Record>,
    ) -> Result<PendingWrite> {
        if !self.cache.optimistic_write(collection, generation, &records) {
            return Err(superseded(collection));
        }
        let (reply, rx) = oneshot::channel();
        self.length.fetch_add(1, Ordering::SeqCst);

        let job = WriteJob {
            collection: collection.to_string(),
            generation,
            records,
            enqueued_at: Utc::now(),
            reply,
        };
        if self.tx.send(job).is_err() {
            self.length.fetch_sub(1, Ordering::SeqCst);
            self.cache.settle(collection);
            return Err(MushafDbError::QueueClosed);
        }

        Ok(PendingWrite {
            collection: collection.to_string(),
            rx,
        })
    }

    /// Writes queued or in flight.
    pub fn len(&self) -> usize {
        self.length.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
    cache: Arc<CollectionCache>,
    retry: RetryConfig,
    length: Arc<AtomicUsize>,
) {
    while let Some(job) = rx.recv().await {
        let result = if cache.generation(&job.collection) == job.generation {
            persist(&cache, &job, retry).await
        } else {
            Err(superseded(&job.collection))
        };
        cache.settle(&job.collection);

        match &result {
            Ok(()) => log::debug!(
                "Committed '{}' ({} records, queued {}ms)",
                job.collection,
                job.records.len(),
                (Utc::now() - job.enqueued_at).num_milliseconds()
            ),
            Err(e) => log::error!("Write failed for '{}': {e}", job.collection),
        }

        // Capture the committed revision, or roll the optimistic view back.
        let after = match &result {
            Err(e) if !matches!(e, MushafDbError::Superseded { .. }) => {
                cache.rollback(&job.collection).await
            }
            _ => cache.refresh(&job.collection).await,
        };
        if let Err(e) = after {
            log::warn!("Refresh after write to '{}' failed: {e}", job.collection);
        }

        length.fetch_sub(1, Ordering::SeqCst);
        let _ = job.reply.send(result.map(|()| job.records));
    }
    log::debug!("Write queue stopped");
}

fn superseded(collection: &str) -> MushafDbError {
    MushafDbError::Superseded {
        collection: collection.to_string(),
    }
}

async fn persist(cache: &CollectionCache, job: &WriteJob, retry: RetryConfig) -> Result<()> {
    let remote = cache.remote();
    let path = cache.path(&job.collection);
    let message = format!("Update {} - {}", job.collection, Utc::now().to_rfc3339());
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let result = async {
            let current = cache.refresh(&job.collection).await?;
            remote
                .write(WriteRequest {
                    path: &path,
                    records: &job.records,
                    message: &message,
                    expected_revision: current.revision_id.as_deref(),
                })
                .await?;
            Ok::<(), MushafDbError>(())
        }
        .await;

        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let retryable =
            matches!(&err, MushafDbError::Remote(remote_err) if remote_err.is_retryable());
        if retryable && attempts <= retry.max_retries {
            log::warn!(
                "Retry {attempts}/{} for '{}': {err}",
                retry.max_retries,
                job.collection
            );
            tokio::time::sleep(retry.delay()).await;
            continue;
        }

        return Err(match err {
            MushafDbError::Remote(RemoteError::Conflict { .. }) => MushafDbError::Conflict {
                collection: job.collection.clone(),
                attempts,
            },
            other => other,
        });
    }
}
