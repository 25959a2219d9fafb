use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::remote::RemoteError;
use crate::storage::{KeyValueStore, StorageResult};
use crate::utils::format_age;

/// Consider cache stale after 1 hour.
const CACHE_STALE_MINUTES: i64 = 60;

/// Storage key holding the list of cached keys.
const INDEX_KEY: &str = "cache.index";

/// Storage key prefix for cached entries.
const ENTRY_PREFIX: &str = "cache:";

/// Build a cache key for one collection of an entity class.
pub fn cache_key(class: &str, scope: &str) -> String {
    format!("{}:{}", class, scope)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
    /// Set when a synced change made this copy out of date.
    #[serde(default)]
    pub invalidated: bool,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
            invalidated: false,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        format_age(self.age_minutes())
    }

    pub fn is_stale(&self, stale_after_minutes: i64) -> bool {
        self.invalidated || self.age_minutes() > stale_after_minutes
    }
}

/// A cached value handed to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    pub data: T,
    pub fetched_at: DateTime<Utc>,
    /// The value may be out of date: it is old, was invalidated, or a
    /// refresh could not reach the server.
    pub stale: bool,
}

impl<T> CacheRead<T> {
    pub fn age_display(&self) -> String {
        format_age((Utc::now() - self.fetched_at).num_minutes())
    }
}

pub struct ReadThroughCache {
    store: Arc<dyn KeyValueStore>,
    connectivity: Arc<ConnectivityMonitor>,
    index: Mutex<BTreeSet<String>>,
    // One fetch at a time per key
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    // Bumped by every invalidation, per key and per class
    generations: Mutex<HashMap<String, u64>>,
    stale_after_minutes: i64,
}

impl ReadThroughCache {
    pub fn new(store: Arc<dyn KeyValueStore>, connectivity: Arc<ConnectivityMonitor>) -> Self {
        let index = match load_index(store.as_ref()) {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "Cache index unreadable, starting empty");
                BTreeSet::new()
            }
        };

        Self {
            store,
            connectivity,
            index: Mutex::new(index),
            writers: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            stale_after_minutes: CACHE_STALE_MINUTES,
        }
    }

    pub fn with_stale_after_minutes(mut self, minutes: i64) -> Self {
        self.stale_after_minutes = minutes;
        self
    }

    fn index(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<CachedData<T>>> {
        match self.store.get(&entry_key(key))? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }

    fn save<T: Serialize>(&self, key: &str, cached: &CachedData<T>) -> StorageResult<()> {
        let contents = serde_json::to_string(cached)?;
        self.store.set(&entry_key(key), &contents)?;

        let mut index = self.index();
        if !index.contains(key) {
            let mut next = index.clone();
            next.insert(key.to_string());
            self.store.set(INDEX_KEY, &serde_json::to_string(&next)?)?;
            *index = next;
        }
        Ok(())
    }

    fn to_read<T>(&self, cached: CachedData<T>) -> CacheRead<T> {
        let stale = cached.is_stale(self.stale_after_minutes);
        CacheRead {
            data: cached.data,
            fetched_at: cached.cached_at,
            stale,
        }
    }

    /// Return the cached value for `key`, if any. Never touches the
    /// network. Unreadable entries count as missing.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<CacheRead<T>> {
        match self.load(key) {
            Ok(cached) => cached.map(|cached| self.to_read(cached)),
            Err(e) => {
                debug!(key, error = %e, "Cache entry unreadable");
                None
            }
        }
    }

    /// Refresh `key` from the server through `fetcher` and return the fresh
    /// value.
    ///
    /// Offline, the fetcher is not called and the cached value comes back
    /// flagged stale. A transient fetch failure also falls back to the
    /// cached value. With nothing cached, offline yields `Ok(None)` and a
    /// fetch failure is returned.
    ///
    /// An invalidation that lands while the fetch is in flight leaves the
    /// stored entry flagged stale, whatever the fetch returns.
    pub async fn write_through<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
    ) -> Result<Option<CacheRead<T>>, RemoteError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        if !self.connectivity.is_online() {
            debug!(key, "Offline, serving cached copy");
            return Ok(self.read_stale(key));
        }

        let generation = self.generation(key);
        let writer = self.writer(key);
        let _guard = writer.lock().await;

        let result = fetcher().await;
        let invalidated = self.generation(key) != generation;
        if invalidated {
            debug!(key, "Invalidated during refresh");
        }

        match result {
            Ok(data) => {
                let mut cached = CachedData::new(data);
                cached.invalidated = invalidated;
                if let Err(e) = self.save(key, &cached) {
                    warn!(key, error = %e, "Failed to save cache entry");
                }
                Ok(Some(self.to_read(cached)))
            }
            Err(e) => {
                if invalidated {
                    self.write_invalidated(key);
                }
                if !e.is_transient() {
                    return Err(e);
                }
                match self.read_stale(key) {
                    Some(cached) => {
                        debug!(key, error = %e, "Refresh failed, serving cached copy");
                        Ok(Some(cached))
                    }
                    None => Err(e),
                }
            }
        }
    }

    fn read_stale<T: DeserializeOwned>(&self, key: &str) -> Option<CacheRead<T>> {
        self.read(key).map(|mut cached| {
            cached.stale = true;
            cached
        })
    }

    fn writer(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(writers.entry(key.to_string()).or_default())
    }

    fn generations(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.generations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump_generation(&self, name: &str) {
        *self.generations().entry(name.to_string()).or_default() += 1;
    }

    /// Invalidation count for `key` and its class. Only ever grows.
    fn generation(&self, key: &str) -> u64 {
        let class = key.split_once(':').map_or(key, |(class, _)| class);
        let generations = self.generations();
        generations.get(key).copied().unwrap_or(0) + generations.get(class).copied().unwrap_or(0)
    }

    /// Flag `key` as out of date. The value stays readable.
    pub fn invalidate(&self, key: &str) {
        self.bump_generation(key);
        self.mark_invalidated(key);
    }

    /// Flag the stored entry unless a refresh holds the key; that refresh
    /// sees the new generation and flags its own result.
    fn mark_invalidated(&self, key: &str) {
        let writer = self.writer(key);
        let Ok(_guard) = writer.try_lock() else {
            debug!(key, "Refresh in flight, leaving invalidation to it");
            return;
        };
        self.write_invalidated(key);
    }

    fn write_invalidated(&self, key: &str) {
        let result = self.load::<serde_json::Value>(key).and_then(|cached| match cached {
            Some(mut cached) if !cached.invalidated => {
                cached.invalidated = true;
                self.save(key, &cached)
            }
            _ => Ok(()),
        });
        if let Err(e) = result {
            warn!(key, error = %e, "Failed to invalidate cache entry");
        }
    }

    /// Flag every entry of an entity class as out of date.
    pub fn invalidate_class(&self, class: &str) {
        let prefix = format!("{}:", class);
        let keys: Vec<String> = self
            .index()
            .iter()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        debug!(class, entries = keys.len(), "Invalidating cache class");
        self.bump_generation(class);
        for key in keys {
            self.mark_invalidated(&key);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.index().iter().cloned().collect()
    }
}

fn entry_key(key: &str) -> String {
    format!("{}{}", ENTRY_PREFIX, key)
}

fn load_index(store: &dyn KeyValueStore) -> StorageResult<BTreeSet<String>> {
    match store.get(INDEX_KEY)? {
        Some(contents) => Ok(serde_json::from_str(&contents)?),
        None => Ok(BTreeSet::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{EVENTS, MEMBERS};
    use crate::storage::MemoryStore;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(online: bool) -> (ReadThroughCache, Arc<ConnectivityMonitor>) {
        let monitor = Arc::new(ConnectivityMonitor::new(online));
        let cache = ReadThroughCache::new(Arc::new(MemoryStore::new()), Arc::clone(&monitor));
        (cache, monitor)
    }

    #[test]
    fn test_cached_data_age_display_just_now() {
        let cached = CachedData::new(vec![1, 2, 3]);
        assert_eq!(cached.age_display(), "just now");
    }

    #[test]
    fn test_cached_data_is_stale() {
        let fresh = CachedData::new(vec![1]);
        assert!(!fresh.is_stale(CACHE_STALE_MINUTES));

        let mut old = CachedData::new(vec![1]);
        old.cached_at = Utc::now() - Duration::minutes(61);
        assert!(old.is_stale(CACHE_STALE_MINUTES));

        let mut invalidated = CachedData::new(vec![1]);
        invalidated.invalidated = true;
        assert!(invalidated.is_stale(CACHE_STALE_MINUTES));
    }

    #[test]
    fn test_read_missing_key() {
        let (cache, _) = cache(true);
        assert!(cache.read::<Vec<String>>("members:c1").is_none());
    }

    #[tokio::test]
    async fn test_write_through_online_stores_fresh_value() {
        let (cache, _) = cache(true);
        let key = cache_key(MEMBERS, "c1");

        let read = cache
            .write_through(&key, || async { Ok(vec!["Ana".to_string()]) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.data, vec!["Ana".to_string()]);
        assert!(!read.stale);

        let cached: CacheRead<Vec<String>> = cache.read(&key).unwrap();
        assert_eq!(cached.data, vec!["Ana".to_string()]);
        assert!(!cached.stale);
        assert_eq!(cached.age_display(), "just now");
    }

    #[tokio::test]
    async fn test_write_through_offline_serves_stale_without_fetching() {
        let (cache, monitor) = cache(true);
        let key = cache_key(MEMBERS, "c1");
        cache.write_through(&key, || async { Ok(vec![1u32]) }).await.unwrap();

        monitor.report(false);
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let read = cache
            .write_through(&key, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![2u32])
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(read.data, vec![1]);
        assert!(read.stale);
    }

    #[tokio::test]
    async fn test_write_through_offline_with_empty_cache() {
        let (cache, _) = cache(false);
        let read = cache
            .write_through("events:c1", || async { Ok(vec![1u32]) })
            .await
            .unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_falls_back_to_cache() {
        let (cache, _) = cache(true);
        let key = cache_key(EVENTS, "c1");
        cache.write_through(&key, || async { Ok(vec![1u32]) }).await.unwrap();

        let read = cache
            .write_through(&key, || async {
                Err::<Vec<u32>, _>(RemoteError::from_status(503, "unavailable"))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.data, vec![1]);
        assert!(read.stale);

        let err = cache
            .write_through("events:c2", || async {
                Err::<Vec<u32>, _>(RemoteError::from_status(503, "unavailable"))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_permanent_fetch_failure_is_returned() {
        let (cache, _) = cache(true);
        let key = cache_key(EVENTS, "c1");
        cache.write_through(&key, || async { Ok(vec![1u32]) }).await.unwrap();

        let err = cache
            .write_through(&key, || async {
                Err::<Vec<u32>, _>(RemoteError::from_status(403, "denied"))
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_invalidate_class_marks_only_that_class() {
        let (cache, _) = cache(true);
        let members = cache_key(MEMBERS, "c1");
        let events = cache_key(EVENTS, "c1");
        cache.write_through(&members, || async { Ok(vec![1u32]) }).await.unwrap();
        cache.write_through(&events, || async { Ok(vec![2u32]) }).await.unwrap();

        cache.invalidate_class(MEMBERS);

        let member_read: CacheRead<Vec<u32>> = cache.read(&members).unwrap();
        assert!(member_read.stale);
        assert_eq!(member_read.data, vec![1]);
        let event_read: CacheRead<Vec<u32>> = cache.read(&events).unwrap();
        assert!(!event_read.stale);

        cache.write_through(&members, || async { Ok(vec![3u32]) }).await.unwrap();
        let refreshed: CacheRead<Vec<u32>> = cache.read(&members).unwrap();
        assert!(!refreshed.stale);
    }

    #[tokio::test]
    async fn test_invalidation_during_first_fetch_flags_result() {
        let (cache, _) = cache(true);
        let key = cache_key(MEMBERS, "c1");

        let c = &cache;
        let read = cache
            .write_through(&key, move || async move {
                c.invalidate_class(MEMBERS);
                Ok(vec![2u32])
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(read.data, vec![2]);
        assert!(read.stale);
        assert!(cache.read::<Vec<u32>>(&key).unwrap().stale);

        cache.write_through(&key, || async { Ok(vec![3u32]) }).await.unwrap();
        assert!(!cache.read::<Vec<u32>>(&key).unwrap().stale);
    }

    #[tokio::test]
    async fn test_invalidation_during_failed_refresh_is_kept() {
        let (cache, _) = cache(true);
        let key = cache_key(MEMBERS, "c1");
        cache.write_through(&key, || async { Ok(vec![1u32]) }).await.unwrap();

        let c = &cache;
        let k = key.as_str();
        let read = cache
            .write_through(&key, move || async move {
                c.invalidate(k);
                Err::<Vec<u32>, _>(RemoteError::from_status(503, "unavailable"))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.data, vec![1]);

        let stored: CacheRead<Vec<u32>> = cache.read(&key).unwrap();
        assert!(stored.stale);
        assert_eq!(stored.data, vec![1]);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let monitor = Arc::new(ConnectivityMonitor::new(true));
        let cache = ReadThroughCache::new(Arc::clone(&store), Arc::clone(&monitor));
        cache.write_through("members:c1", || async { Ok(1u32) }).await.unwrap();

        let reopened = ReadThroughCache::new(store, monitor);
        assert_eq!(reopened.keys(), vec!["members:c1".to_string()]);
        reopened.invalidate_class(MEMBERS);
        assert!(reopened.read::<u32>("members:c1").unwrap().stale);
    }
}
