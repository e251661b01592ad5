use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::auth::{self, Session, SessionStore, PASSWORD_FIELD};
use crate::cache::{CacheEntry, CollectionCache};
use crate::config::StoreConfig;
use crate::error::{MushafDbError, Result};
use crate::migration::{Migration, MigrationRegistry};
use crate::query::Query;
use crate::queue::WriteQueue;
use crate::record::{self, Record, ID_FIELD, UID_FIELD};
use crate::remote::{GitHubStore, RemoteStore};
use crate::schema::{CollectionSchema, SchemaRegistry};
use crate::validation::{check_unique, validate_and_prepare};
use crate::watcher::{ListenerRegistry, Subscription, Watcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OnceCell};

const USERS: &str = "users";

/// Handle to a GitHub-backed document store.
///
/// Cheap to clone; clones share the cache, the write queue, subscriptions,
/// sessions and the audit log. Mutations apply to the cache immediately and
/// resolve once the write queue has persisted them.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: Arc<StoreConfig>,
    schemas: RwLock<SchemaRegistry>,
    migrations: RwLock<MigrationRegistry>,
    cache: Arc<CollectionCache>,
    queue: WriteQueue,
    watcher: Arc<Watcher>,
    audit: AuditLog,
    sessions: SessionStore,
    /// Held from reading a collection until its new content is queued.
    mutation: Mutex<()>,
    initialized: OnceCell<()>,
}

/// Snapshot returned by [`Store::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    pub owner: String,
    pub repo: String,
    pub connected: bool,
    pub collections: Vec<String>,
    pub initialized: bool,
    pub queue_length: usize,
    pub time: DateTime<Utc>,
}

impl Store {
    /// Build a store over `remote` without running evolution.
    ///
    /// Spawns the write queue worker, so it must be called inside a tokio runtime.
    pub fn new(config: StoreConfig, remote: Arc<dyn RemoteStore>) -> Self {
        let config = Arc::new(config);
        let cache = Arc::new(CollectionCache::new(
            remote,
            Arc::clone(&config),
            Arc::new(ListenerRegistry::new()),
        ));
        let queue = WriteQueue::start(Arc::clone(&cache), config.retry);
        let watcher = Arc::new(Watcher::new(Arc::clone(&cache), config.poll_interval()));

        Store {
            inner: Arc::new(StoreInner {
                schemas: RwLock::new(SchemaRegistry::with_overrides(&config.schemas)),
                migrations: RwLock::new(MigrationRegistry::builtin()),
                sessions: SessionStore::new(config.session_ttl()),
                audit: AuditLog::new(),
                config,
                cache,
                queue,
                watcher,
                mutation: Mutex::new(()),
                initialized: OnceCell::new(),
            }),
        }
    }

    /// Store over the GitHub repository named by `config`. Nothing is fetched yet.
    pub fn connect(config: StoreConfig) -> Self {
        let mut github =
            GitHubStore::new(&config.owner, &config.repo, &config.token, &config.branch);
        if let Some(api_base) = &config.api_base {
            github = github.with_api_base(api_base);
        }
        Self::new(config, Arc::new(github))
    }

    /// [`Store::connect`], then run evolution.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let store = Self::connect(config);
        store.init().await?;
        Ok(store)
    }

    /// Run evolution once. Later calls return immediately; a failed run may be retried.
    pub async fn init(&self) -> Result<()> {
        self.inner
            .initialized
            .get_or_try_init(|| self.run_evolution())
            .await?;
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn schema(&self, collection: &str) -> Option<CollectionSchema> {
        self.inner
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .cloned()
    }

    /// Add or replace the schema of a collection.
    pub fn register_schema(&self, collection: &str, schema: CollectionSchema) {
        self.inner
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(collection, schema);
    }

    /// Attach a domain check that runs after the declarative rules of `collection`.
    pub fn set_validation<F>(&self, collection: &str, predicate: F) -> Result<()>
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        let registered = self
            .inner
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_predicate(collection, predicate);
        if registered {
            Ok(())
        } else {
            Err(MushafDbError::Schema(format!("No schema for collection '{collection}'")))
        }
    }

    pub fn register_migration(&self, collection: &str, migration: Migration) -> Result<()> {
        self.inner
            .migrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(collection, migration)
    }

    fn collection_names(&self) -> Vec<String> {
        self.inner
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .collection_names()
            .to_vec()
    }

    fn migrations(&self) -> MigrationRegistry {
        self.inner
            .migrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Create missing collection files and apply pending migrations, one
    /// collection at a time in registry order. Stops at the first failure.
    pub async fn run_evolution(&self) -> Result<()> {
        let names = self.collection_names();
        for name in &names {
            self.ensure_collection(name).await?;
            self.apply_migrations(name).await?;
        }
        log::info!("Schema evolution completed for {} collections", names.len());
        Ok(())
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let pending = {
            let _guard = self.inner.mutation.lock().await;
            let refreshed = self.inner.cache.refresh(collection).await?;
            let has_pending = self
                .inner
                .cache
                .entry(collection)
                .is_some_and(|e| e.pending_writes > 0);
            if refreshed.exists || has_pending {
                return Ok(());
            }
            self.inner
                .queue
                .enqueue(collection, refreshed.generation, Vec::new())?
        };
        pending.wait().await?;
        log::info!("Created collection '{collection}'");
        Ok(())
    }

    async fn apply_migrations(&self, collection: &str) -> Result<()> {
        let migrations = self.migrations();
        if migrations.for_collection(collection).is_empty() {
            return Ok(());
        }

        let pending = {
            let _guard = self.inner.mutation.lock().await;
            let snapshot = self.inner.cache.snapshot(collection, false).await?;
            let migrated = migrations.migrate_up(collection, snapshot.records.clone())?;
            if migrated == snapshot.records {
                log::debug!(
                    "'{collection}' is already at v{}",
                    migrations.latest_version(collection)
                );
                return Ok(());
            }
            self.inner
                .queue
                .enqueue(collection, snapshot.generation, migrated)?
        };
        pending.wait().await?;
        log::info!("Migrated '{collection}' to v{}", migrations.latest_version(collection));
        Ok(())
    }

    /// Undo every migration of `collection` above `target_version`, newest first.
    pub async fn revert_migrations(
        &self,
        collection: &str,
        target_version: u32,
    ) -> Result<Vec<Record>> {
        let migrations = self.migrations();
        let pending = {
            let _guard = self.inner.mutation.lock().await;
            let snapshot = self.inner.cache.snapshot(collection, true).await?;
            let reverted =
                migrations.migrate_down(collection, snapshot.records.clone(), target_version)?;
            if reverted == snapshot.records {
                return Ok(snapshot.records);
            }
            self.inner
                .queue
                .enqueue(collection, snapshot.generation, reverted)?
        };
        let written = pending.wait().await?;
        log::info!("Reverted '{collection}' to v{target_version}");
        Ok(written)
    }

    /// All records of `collection`. A missing collection reads as empty.
    pub async fn get(&self, collection: &str, force: bool) -> Result<Vec<Record>> {
        self.inner.cache.read(collection, force).await
    }

    /// The record whose `id` or `uid` equals `key`.
    pub async fn get_item(&self, collection: &str, key: &str) -> Result<Record> {
        self.get(collection, false)
            .await?
            .into_iter()
            .find(|r| record::matches_key(r, key))
            .ok_or_else(|| not_found(collection, key))
    }

    pub fn query(&self, collection: &str) -> Query {
        Query::new(self.clone(), collection)
    }

    /// Call `listener` with the current records now and on every later change.
    ///
    /// The collection is polled while it has at least one subscriber.
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub async fn subscribe<F>(&self, collection: &str, listener: F) -> Result<Subscription>
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        self.inner.watcher.subscribe(collection, Arc::new(listener)).await
    }

    /// Validate `data`, give it an `id` and `uid`, and append it.
    pub async fn insert(&self, collection: &str, data: Record) -> Result<Record> {
        self.bulk_insert(collection, vec![data])
            .await?
            .pop()
            .ok_or_else(|| {
                MushafDbError::Other(format!("Insert into '{collection}' produced no record"))
            })
    }

    /// Insert several records with one write. Ids continue from the collection's highest id.
    pub async fn bulk_insert(
        &self,
        collection: &str,
        items: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let schema = self.schema(collection);
        let mut prepared = Vec::with_capacity(items.len());
        for mut item in items {
            validate_and_prepare(collection, schema.as_ref(), &mut item)?;
            prepared.push(item);
        }

        let (pending, inserted) = {
            let _guard = self.inner.mutation.lock().await;
            let snapshot = self.inner.cache.snapshot(collection, false).await?;
            let mut records = snapshot.records;
            let start = records.len();
            let inserted = append_with_identity(collection, &mut records, prepared)?;
            let new_positions: Vec<usize> = (start..records.len()).collect();
            check_unique(collection, schema.as_ref(), &records, &new_positions)?;
            let pending = self
                .inner
                .queue
                .enqueue(collection, snapshot.generation, records)?;
            (pending, inserted)
        };

        pending.wait().await?;
        for item in &inserted {
            self.inner.audit.record(collection, AuditAction::Insert, item);
        }
        Ok(inserted)
    }

    /// Shallow-merge `changes` into the record matching `key` and revalidate it.
    pub async fn update(&self, collection: &str, key: &str, changes: Record) -> Result<Record> {
        self.bulk_update(collection, vec![(key.to_string(), changes)])
            .await?
            .pop()
            .ok_or_else(|| not_found(collection, key))
    }

    /// Apply several `(key, changes)` pairs with one write.
    ///
    /// Nothing is written unless every key matches and every merged record validates.
    pub async fn bulk_update(
        &self,
        collection: &str,
        updates: Vec<(String, Record)>,
    ) -> Result<Vec<Record>> {
        let schema = self.schema(collection);

        let (pending, updated) = {
            let _guard = self.inner.mutation.lock().await;
            let snapshot = self.inner.cache.snapshot(collection, true).await?;
            let mut records = snapshot.records;
            let mut positions = Vec::with_capacity(updates.len());
            let mut updated = Vec::with_capacity(updates.len());

            for (key, changes) in &updates {
                let idx = record::position_of(&records, key)
                    .ok_or_else(|| not_found(collection, key))?;
                check_identity_unchanged(collection, &records[idx], changes)?;
                let mut merged = record::merge(&records[idx], changes);
                validate_and_prepare(collection, schema.as_ref(), &mut merged)?;
                records[idx] = merged.clone();
                positions.push(idx);
                updated.push(merged);
            }

            check_unique(collection, schema.as_ref(), &records, &positions)?;
            let pending = self
                .inner
                .queue
                .enqueue(collection, snapshot.generation, records)?;
            (pending, updated)
        };

        pending.wait().await?;
        for item in &updated {
            self.inner.audit.record(collection, AuditAction::Update, item);
        }
        Ok(updated)
    }

    /// Remove records matching `key`. An unknown key removes nothing and is not an error.
    pub async fn delete(&self, collection: &str, key: &str) -> Result<Vec<Record>> {
        self.bulk_delete(collection, &[key]).await
    }

    pub async fn bulk_delete(&self, collection: &str, keys: &[&str]) -> Result<Vec<Record>> {
        let (pending, removed) = {
            let _guard = self.inner.mutation.lock().await;
            let snapshot = self.inner.cache.snapshot(collection, false).await?;
            let (removed, kept): (Vec<Record>, Vec<Record>) = snapshot
                .records
                .into_iter()
                .partition(|r| keys.iter().any(|key| record::matches_key(r, key)));
            let pending = self
                .inner
                .queue
                .enqueue(collection, snapshot.generation, kept)?;
            (pending, removed)
        };

        pending.wait().await?;
        for item in &removed {
            self.inner.audit.record(collection, AuditAction::Delete, item);
        }
        Ok(removed)
    }

    /// Pretty-printed JSON array of the collection.
    pub async fn export_collection(&self, collection: &str) -> Result<String> {
        let records = self.get(collection, false).await?;
        Ok(serde_json::to_string_pretty(&records)?)
    }

    /// Append (or with `overwrite`, replace the collection with) the records
    /// of a JSON array. Every item is validated; identities follow the
    /// bulk insert rules.
    pub async fn import_collection(
        &self,
        collection: &str,
        json: &str,
        overwrite: bool,
    ) -> Result<Vec<Record>> {
        let items = match serde_json::from_str::<Value>(json)? {
            Value::Array(items) => items,
            _ => {
                return Err(MushafDbError::Validation(
                    "Import data must be a JSON array of records".into(),
                ))
            }
        };

        let schema = self.schema(collection);
        let mut prepared = Vec::with_capacity(items.len());
        for item in items {
            let mut item = record::from_value(item)?;
            validate_and_prepare(collection, schema.as_ref(), &mut item)?;
            prepared.push(item);
        }

        let (pending, imported) = {
            let _guard = self.inner.mutation.lock().await;
            let snapshot = self.inner.cache.snapshot(collection, false).await?;
            let mut records = if overwrite {
                Vec::new()
            } else {
                snapshot.records
            };
            let start = records.len();
            let imported = append_with_identity(collection, &mut records, prepared)?;
            let new_positions: Vec<usize> = (start..records.len()).collect();
            check_unique(collection, schema.as_ref(), &records, &new_positions)?;
            let pending = self
                .inner
                .queue
                .enqueue(collection, snapshot.generation, records)?;
            (pending, imported)
        };

        pending.wait().await?;
        for item in &imported {
            self.inner.audit.record(collection, AuditAction::Insert, item);
        }
        log::info!("Imported {} records into '{collection}'", imported.len());
        Ok(imported)
    }

    /// Create a user with a hashed password. The returned record omits the hash.
    pub async fn register(&self, email: &str, password: &str, profile: Record) -> Result<Record> {
        auth::check_email(email)?;
        let users = self.get(USERS, false).await?;
        if users.iter().any(|u| email_of(u) == Some(email)) {
            return Err(MushafDbError::Duplicate("Email already registered".into()));
        }

        let mut data = profile;
        data.insert("email".into(), Value::String(email.to_string()));
        data.insert(PASSWORD_FIELD.into(), Value::String(auth::hash_password(password)));

        let mut user = self.insert(USERS, data).await?;
        user.remove(PASSWORD_FIELD);
        Ok(user)
    }

    /// Check the credentials and open a session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let users = self.get(USERS, false).await?;
        let user = users
            .iter()
            .find(|u| email_of(u) == Some(email))
            .ok_or_else(auth::invalid_credentials)?;
        let stored = user
            .get(PASSWORD_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(auth::invalid_credentials)?;
        if !auth::verify_password(password, stored) {
            return Err(auth::invalid_credentials());
        }

        let session = self.inner.sessions.create(user);
        log::info!("Session opened for user {}", record::id_of(user).unwrap_or_default());
        Ok(session)
    }

    pub fn session(&self, token: &str) -> Option<Session> {
        self.inner.sessions.get(token)
    }

    pub fn current_user(&self, token: &str) -> Option<Record> {
        self.session(token).map(|s| s.user)
    }

    pub fn destroy_session(&self, token: &str) -> bool {
        self.inner.sessions.destroy(token)
    }

    /// Most recent mutations of `collection`, oldest first.
    pub fn audit_log(&self, collection: &str) -> Vec<AuditEntry> {
        self.inner.audit.for_collection(collection)
    }

    pub fn audit_logs(&self) -> HashMap<String, Vec<AuditEntry>> {
        self.inner.audit.all()
    }

    pub fn cache_entry(&self, collection: &str) -> Option<CacheEntry> {
        self.inner.cache.entry(collection)
    }

    pub fn queue_length(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.initialized()
    }

    /// Initialized and pointed at a repository with credentials.
    pub fn is_ready(&self) -> bool {
        let config = &self.inner.config;
        self.is_initialized()
            && !config.owner.is_empty()
            && !config.repo.is_empty()
            && !config.token.is_empty()
    }

    pub fn status(&self) -> StoreStatus {
        let config = &self.inner.config;
        StoreStatus {
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            connected: !config.token.is_empty(),
            collections: self.collection_names(),
            initialized: self.is_initialized(),
            queue_length: self.queue_length(),
            time: Utc::now(),
        }
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

fn not_found(collection: &str, key: &str) -> MushafDbError {
    MushafDbError::NotFound {
        collection: collection.to_string(),
        key: key.to_string(),
    }
}

fn email_of(user: &Record) -> Option<&str> {
    user.get("email").and_then(Value::as_str)
}

/// Append `items` to `records`, keeping caller-supplied `id`/`uid` values
/// that are free and assigning the rest. Assigned ids continue from the
/// highest numeric id seen so far.
fn append_with_identity(
    collection: &str,
    records: &mut Vec<Record>,
    items: Vec<Record>,
) -> Result<Vec<Record>> {
    let mut next_id = record::max_numeric_id(records);
    let mut appended = Vec::with_capacity(items.len());

    for mut item in items {
        let id = match record::id_of(&item) {
            Some(id) => {
                if records.iter().any(|r| record::id_of(r).as_deref() == Some(id.as_str())) {
                    return Err(MushafDbError::Duplicate(format!(
                        "{collection} already has a record with id {id}"
                    )));
                }
                next_id = next_id.max(record::numeric_id(&item));
                id
            }
            None => {
                next_id = next_id.checked_add(1).ok_or_else(|| {
                    MushafDbError::Validation(format!(
                        "No numeric id left to assign in {collection}"
                    ))
                })?;
                next_id.to_string()
            }
        };
        item.insert(ID_FIELD.into(), Value::String(id));

        match record::uid_of(&item) {
            Some(uid) => {
                if records.iter().any(|r| record::uid_of(r).as_deref() == Some(uid.as_str())) {
                    return Err(MushafDbError::Duplicate(format!(
                        "{collection} already has a record with uid {uid}"
                    )));
                }
                item.insert(UID_FIELD.into(), Value::String(uid));
            }
            None => {
                item.insert(UID_FIELD.into(), Value::String(record::new_uid()));
            }
        }

        records.push(item.clone());
        appended.push(item);
    }
    Ok(appended)
}

/// `id` and `uid` may be repeated in changes but never altered.
fn check_identity_unchanged(collection: &str, current: &Record, changes: &Record) -> Result<()> {
    let identity = [
        (ID_FIELD, record::id_of(current)),
        (UID_FIELD, record::uid_of(current)),
    ];
    for (field, existing) in identity {
        let Some(requested) = changes.get(field) else {
            continue;
        };
        let requested = match requested {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        if requested != existing {
            return Err(MushafDbError::Validation(format!(
                "Field {field} cannot be changed in {collection}"
            )));
        }
    }
    Ok(())
}
