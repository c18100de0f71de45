//! Stale-while-revalidate cache with per-key fetch de-duplication
//!
//! Entries are `{data, timestamp}` pairs kept in memory and, when a
//! `KeyValueStorage` is attached, mirrored under a namespaced key.
//!
//! ```text
//! get(key)
//!   ├── fresh entry  → return it
//!   ├── stale entry  → return it, refresh in background (unless one is in flight)
//!   └── no entry     → join or start the key's fetch, wait for it
//! ```
//!
//! Every fetch runs as a spawned task shared through the in-flight map, so
//! a key never has two fetches running and a fetch whose caller went away
//! still lands in the cache.

use crate::{
    config::CacheConfig,
    constants::EVENT_CHANNEL_CAPACITY,
    error::{ApiError, StorageError},
    storage::KeyValueStorage,
    types::{CacheEntry, CacheEvent},
};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

/// A fetch that any number of callers can await
type SharedFetch = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

/// Point-in-time view of the cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Number of entries, fresh or stale
    pub size: usize,
    /// Cached keys, sorted
    pub keys: Vec<String>,
    /// Keys with a fetch in flight, sorted
    pub refreshing: Vec<String>,
    /// Freshness window in milliseconds
    pub duration_ms: u64,
    pub stale_while_revalidate: bool,
    /// Whether entries are mirrored to persistent storage
    pub persistent: bool,
}

/// Cache store handle
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct CacheStore {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    in_flight: Arc<Mutex<HashMap<String, SharedFetch>>>,
    config: Arc<CacheConfig>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    events: broadcast::Sender<CacheEvent>,
}

impl CacheStore {
    /// Creates a memory-only cache
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None, HashMap::new())
    }

    /// Creates a cache mirrored to `storage`
    ///
    /// Persisted entries still within the freshness window are loaded; stale
    /// or unreadable ones are removed from storage right away.
    pub fn with_storage(config: CacheConfig, storage: Arc<dyn KeyValueStorage>) -> Self {
        let entries = load_persisted(storage.as_ref(), &config);
        Self::build(config, Some(storage), entries)
    }

    fn build(
        config: CacheConfig,
        storage: Option<Arc<dyn KeyValueStorage>>,
        entries: HashMap<String, CacheEntry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(entries)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
            storage,
            events,
        }
    }

    /// Returns the cached value for `key`, fetching it with `fetch_fn` when needed
    ///
    /// `fetch_fn` is only invoked if this call ends up starting a fetch; it
    /// is dropped when the entry is fresh or a fetch is already in flight.
    ///
    /// # Arguments
    /// * `key` - Cache key of the resource
    /// * `fetch_fn` - Produces the fetch future for `key`
    ///
    /// # Returns
    /// The fresh value, the stale value while a refresh runs in the
    /// background, or the outcome of the fetch this call waited on
    pub async fn get<F, Fut>(&self, key: &str, fetch_fn: F) -> Result<Value, ApiError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let cached = self.entries.read().await.get(key).cloned();

        if let Some(entry) = cached {
            if !entry.is_stale(self.config.duration) {
                tracing::debug!(key, "Cache hit");
                return Ok(entry.data);
            }

            if self.config.stale_while_revalidate {
                let (_, started) = self.join_or_start(key, fetch_fn, false).await;
                tracing::debug!(
                    key,
                    age_ms = entry.age().as_millis() as u64,
                    refresh_started = started,
                    "Serving stale entry"
                );
                return Ok(entry.data);
            }
        }

        tracing::debug!(key, "Cache miss");
        let (fetch, _) = self.join_or_start(key, fetch_fn, false).await;
        fetch.await
    }

    /// Fetches `key` regardless of freshness and waits for the result
    ///
    /// Joins the fetch already in flight for `key` if there is one.
    ///
    /// # Arguments
    /// * `key` - Cache key of the resource
    /// * `fetch_fn` - Produces the fetch future for `key`
    ///
    /// # Returns
    /// The outcome of the fetch, which has also been written to the cache
    /// on success
    pub async fn revalidate<F, Fut>(&self, key: &str, fetch_fn: F) -> Result<Value, ApiError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let (fetch, _) = self.join_or_start(key, fetch_fn, true).await;
        fetch.await
    }

    /// Returns the fetch in flight for `key`, starting one if there is none
    ///
    /// Unless `force` is set, a fresh entry found under the in-flight lock is
    /// returned as an already settled fetch; it may have landed after the
    /// caller's first look. The flag is true when this call started a fetch.
    async fn join_or_start<F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
        force: bool,
    ) -> (SharedFetch, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(existing) = in_flight.get(key) {
            return (existing.clone(), false);
        }

        if !force {
            let landed = self
                .entries
                .read()
                .await
                .get(key)
                .filter(|entry| !entry.is_stale(self.config.duration))
                .map(|entry| entry.data.clone());
            if let Some(data) = landed {
                tracing::debug!(key, "Fetch already landed");
                return (future::ready(Ok::<Value, ApiError>(data)).boxed().shared(), false);
            }
        }

        let fetch = self.spawn_fetch(key, fetch_fn);
        in_flight.insert(key.to_string(), fetch.clone());
        (fetch, true)
    }

    /// Spawns the fetch task for `key`
    ///
    /// Must be called with the in-flight lock held; the task removes its own
    /// ticket after writing the result, which it can only do once that lock
    /// is released.
    fn spawn_fetch<F, Fut>(&self, key: &str, fetch_fn: F) -> SharedFetch
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let store = self.clone();
        let key = key.to_string();
        let pending = fetch_fn();

        let fetch = async move {
            let result = pending.await;
            match &result {
                Ok(data) => {
                    store.set(&key, data.clone()).await;
                    let _ = store.events.send(CacheEvent::entry_updated(&key));
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Cache fetch failed");
                    let _ = store
                        .events
                        .send(CacheEvent::fetch_failed(&key, e.to_string()));
                }
            }
            store.in_flight.lock().await.remove(&key);
            result
        }
        .boxed()
        .shared();

        tokio::spawn(fetch.clone());
        fetch
    }

    /// Overwrites the entry for `key` with `data` stamped now
    pub async fn set(&self, key: &str, data: Value) {
        self.insert_entry(key, CacheEntry::new(data)).await;
    }

    /// Stores a prepared entry as is
    ///
    /// Memory and storage are written under the same guard, so racing
    /// writers leave both holding the same value.
    pub async fn insert_entry(&self, key: &str, entry: CacheEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), entry);
        if let Some(entry) = entries.get(key) {
            self.persist(key, entry);
        }
    }

    /// Reads the entry for `key` without triggering any fetch
    pub async fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Removes one entry, returning whether it existed
    pub async fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(key).is_some();
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove_item(&self.storage_key(key)) {
                tracing::warn!(key, error = %e, "Failed to remove persisted cache entry");
            }
        }
        removed
    }

    /// Removes every entry
    ///
    /// Only namespaced keys are removed from persistent storage.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();

        let Some(storage) = &self.storage else {
            return;
        };
        let keys = match storage.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list persisted cache entries");
                return;
            }
        };
        for key in keys
            .iter()
            .filter(|k| k.starts_with(&self.config.storage_prefix))
        {
            if let Err(e) = storage.remove_item(key) {
                tracing::warn!(key = %key, error = %e, "Failed to remove persisted cache entry");
            }
        }
    }

    /// Whether a fetch for `key` is in flight
    pub async fn is_refreshing(&self, key: &str) -> bool {
        self.in_flight.lock().await.contains_key(key)
    }

    /// Subscribes to entry updates and fetch failures
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Snapshot for diagnostics
    pub async fn status(&self) -> CacheStatus {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        let mut refreshing: Vec<String> = self.in_flight.lock().await.keys().cloned().collect();
        refreshing.sort();

        CacheStatus {
            size: keys.len(),
            keys,
            refreshing,
            duration_ms: self.config.duration.as_millis() as u64,
            stale_while_revalidate: self.config.stale_while_revalidate,
            persistent: self.storage.is_some(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.storage_prefix, key)
    }

    fn persist(&self, key: &str, entry: &CacheEntry) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = serde_json::to_string(entry)
            .map_err(StorageError::from)
            .and_then(|json| storage.set_item(&self.storage_key(key), &json));
        if let Err(e) = result {
            tracing::warn!(key, error = %e, "Failed to persist cache entry");
        }
    }
}

/// Loads fresh persisted entries and drops the rest from storage
fn load_persisted(
    storage: &dyn KeyValueStorage,
    config: &CacheConfig,
) -> HashMap<String, CacheEntry> {
    let mut entries = HashMap::new();
    let keys = match storage.keys() {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load persisted cache");
            return entries;
        }
    };

    for storage_key in keys {
        let Some(key) = storage_key.strip_prefix(config.storage_prefix.as_str()) else {
            continue;
        };

        let raw = match storage.get_item(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read persisted cache entry");
                continue;
            }
        };

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if !entry.is_stale(config.duration) => {
                entries.insert(key.to_string(), entry);
            }
            _ => {
                tracing::debug!(key, "Dropping stale persisted cache entry");
                if let Err(e) = storage.remove_item(&storage_key) {
                    tracing::warn!(key, error = %e, "Failed to remove persisted cache entry");
                }
            }
        }
    }

    tracing::debug!(count = entries.len(), "Loaded persisted cache entries");
    entries
}
