//! Collection subscriptions.
//!
//! Listeners are fanned out from the cache whenever a refresh fetches new
//! content or an optimistic write lands. Each subscribed collection has one
//! polling task that performs a conditional refresh on a fixed interval; it is
//! started by the first listener and aborted when the last one leaves.

use crate::cache::CollectionCache;
use crate::error::Result;
use crate::record::Record;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Callback receiving the full record list of a collection.
pub type Listener = Arc<dyn Fn(&[Record]) + Send + Sync>;

/// Listeners per collection, keyed by subscription id.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Listener)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the subscription id and whether this is the collection's first listener.
    pub fn add(&self, collection: &str, listener: Listener) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.lock();
        let set = listeners.entry(collection.to_string()).or_default();
        set.push((id, listener));
        (id, set.len() == 1)
    }

    /// Returns true when the collection has no listeners left.
    pub fn remove(&self, collection: &str, id: u64) -> bool {
        let mut listeners = self.lock();
        let Some(set) = listeners.get_mut(collection) else {
            return true;
        };
        set.retain(|(existing, _)| *existing != id);
        if set.is_empty() {
            listeners.remove(collection);
            true
        } else {
            false
        }
    }

    pub fn count(&self, collection: &str) -> usize {
        self.lock().get(collection).map_or(0, Vec::len)
    }

    /// Invoke every listener of `collection`. Callbacks run outside the registry lock.
    pub fn notify(&self, collection: &str, records: &[Record]) {
        let targets: Vec<Listener> = match self.lock().get(collection) {
            Some(set) => set.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in targets {
            listener(records);
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<String, usize> = self
            .lock()
            .iter()
            .map(|(name, set)| (name.clone(), set.len()))
            .collect();
        f.debug_struct("ListenerRegistry").field("listeners", &counts).finish()
    }
}

/// Owns the polling tasks of subscribed collections.
pub struct Watcher {
    cache: Arc<CollectionCache>,
    listeners: Arc<ListenerRegistry>,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
    interval: Duration,
}

impl Watcher {
    pub fn new(cache: Arc<CollectionCache>, interval: Duration) -> Self {
        let listeners = cache.listeners();
        Self {
            cache,
            listeners,
            pollers: Mutex::new(HashMap::new()),
            interval,
        }
    }

    fn pollers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` for `collection`.
    ///
    /// The listener is called right away with the current records (fetched
    /// when nothing is cached, or when this is the collection's first
    /// listener), then on every change. Dropping the returned handle
    /// unsubscribes.
    pub async fn subscribe(
        self: &Arc<Self>,
        collection: &str,
        listener: Listener,
    ) -> Result<Subscription> {
        let first = self.listeners.count(collection) == 0;
        let records = self.cache.read(collection, first).await?;
        listener(&records);

        // The pollers lock also covers the listener set change, so a racing
        // last unsubscribe cannot abort the poller started here.
        let id = {
            let mut pollers = self.pollers();
            let (id, first) = self.listeners.add(collection, listener);
            if first {
                self.start_polling(&mut pollers, collection);
            }
            id
        };
        log::debug!("Subscribed #{id} to '{collection}'");

        Ok(Subscription {
            watcher: Arc::downgrade(self),
            collection: collection.to_string(),
            id,
            active: true,
        })
    }

    fn unsubscribe(&self, collection: &str, id: u64) {
        let mut pollers = self.pollers();
        if self.listeners.remove(collection, id) {
            if let Some(handle) = pollers.remove(collection) {
                handle.abort();
                log::debug!("Stopped polling '{collection}'");
            }
        }
    }

    fn start_polling(&self, pollers: &mut HashMap<String, JoinHandle<()>>, collection: &str) {
        let cache = Arc::downgrade(&self.cache);
        let name = collection.to_string();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                if let Err(e) = cache.refresh(&name).await {
                    log::warn!("Polling '{name}' failed: {e}");
                }
            }
        });

        if let Some(previous) = pollers.insert(collection.to_string(), handle) {
            previous.abort();
        }
        log::debug!("Polling '{collection}' every {:?}", self.interval);
    }

    /// Collections that currently have a polling task.
    pub fn polled_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pollers().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        for (_, handle) in self.pollers().drain() {
            handle.abort();
        }
    }
}

/// Handle returned by [`Watcher::subscribe`]. Unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    watcher: Weak<Watcher>,
    collection: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(watcher) = self.watcher.upgrade() {
            watcher.unsubscribe(&self.collection, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("collection", &self.collection)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::remote::MemoryRemote;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        crate::record::from_value(value).unwrap()
    }

    fn counting_listener() -> (Listener, Arc<Mutex<Vec<usize>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |records: &[Record]| {
            sink.lock().unwrap().push(records.len());
        });
        (listener, seen)
    }

    #[test]
    fn test_registry_add_remove() {
        let registry = ListenerRegistry::new();
        let (a, _) = counting_listener();
        let (b, _) = counting_listener();
        let (id_a, first_a) = registry.add("surahs", a);
        let (id_b, first_b) = registry.add("surahs", b);
        assert!(first_a);
        assert!(!first_b);
        assert!(!registry.remove("surahs", id_a));
        assert!(registry.remove("surahs", id_b));
        assert_eq!(registry.count("surahs"), 0);
    }

    #[test]
    fn test_notify_only_reaches_collection_listeners() {
        let registry = ListenerRegistry::new();
        let (a, seen_a) = counting_listener();
        let (b, seen_b) = counting_listener();
        registry.add("surahs", a);
        registry.add("ayahs", b);
        registry.notify("surahs", &[record(json!({ "id": "1" }))]);
        assert_eq!(*seen_a.lock().unwrap(), vec![1]);
        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_with_last_listener() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_file("db/surahs.json", vec![record(json!({ "id": "1" }))]);
        let config = Arc::new(StoreConfig::new("o", "r", "t"));
        let cache = Arc::new(CollectionCache::new(
            remote.clone(),
            config,
            Arc::new(ListenerRegistry::new()),
        ));
        let watcher = Arc::new(Watcher::new(cache, Duration::from_secs(10)));

        let (listener, seen) = counting_listener();
        let subscription = watcher.subscribe("surahs", listener).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(watcher.polled_collections(), vec!["surahs"]);

        remote.put_file(
            "db/surahs.json",
            vec![record(json!({ "id": "1" })), record(json!({ "id": "2" }))],
        );
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        subscription.unsubscribe();
        assert!(watcher.polled_collections().is_empty());
        let fetches = remote.fetch_count("db/surahs.json");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(remote.fetch_count("db/surahs.json"), fetches);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_poller_follows_listeners_under_concurrent_churn() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_file("db/surahs.json", vec![]);
        let config = Arc::new(StoreConfig::new("o", "r", "t"));
        let cache = Arc::new(CollectionCache::new(
            remote,
            config,
            Arc::new(ListenerRegistry::new()),
        ));
        let watcher = Arc::new(Watcher::new(cache, Duration::from_secs(3600)));

        for _ in 0..200 {
            let (listener, _) = counting_listener();
            let leaving = watcher.subscribe("surahs", listener).await.unwrap();

            let joiner = {
                let watcher = Arc::clone(&watcher);
                tokio::spawn(async move {
                    let (listener, _) = counting_listener();
                    watcher.subscribe("surahs", listener).await.unwrap()
                })
            };
            let leaver = tokio::spawn(async move { drop(leaving) });

            leaver.await.unwrap();
            let staying = joiner.await.unwrap();
            assert_eq!(watcher.listeners.count("surahs"), 1);
            assert_eq!(watcher.polled_collections(), vec!["surahs"]);

            drop(staying);
            assert!(watcher.polled_collections().is_empty());
        }
    }
}
