//! LRU + TTL cache of prepared-statement handles.
//!
//! Keyed by (connection kind, SQL text) so dialect-specific placeholder syntax
//! never crosses kinds. An entry older than the TTL is a miss: its handle is
//! closed and a fresh one prepared. A background sweeper closes expired
//! handles that are never looked up again.
//!
//! Handles are always closed outside the cache lock.

use super::driver::{PreparedStatement, StatementPreparer};
use super::lock;
use super::telemetry::{SharedObserver, noop};
use crate::config::StatementCacheConfig;
use crate::error::DbResult;
use crate::models::{DatabaseType, StatementCacheStats, hit_rate};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Cache key: connection kind plus SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub kind: DatabaseType,
    pub sql: String,
}

impl StatementKey {
    pub fn new(kind: DatabaseType, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
        }
    }
}

/// Why a handle left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Older than the TTL (lazy on lookup, or by the sweeper).
    Expired,
    /// Least recently used entry displaced at capacity.
    Capacity,
    /// Overwritten by `put` or a concurrent preparation of the same key.
    Replaced,
    Removed,
    Cleared,
}

pub type EvictCallback = Arc<dyn Fn(&StatementKey, EvictionReason) + Send + Sync>;

struct CacheEntry {
    handle: Arc<dyn PreparedStatement>,
    created_at: Instant,
    last_accessed: Instant,
    hits: u64,
}

impl CacheEntry {
    fn new(handle: Arc<dyn PreparedStatement>) -> Self {
        let now = Instant::now();
        Self {
            handle,
            created_at: now,
            last_accessed: now,
            hits: 0,
        }
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }
}

enum Lookup {
    Hit(Arc<dyn PreparedStatement>),
    Stale,
    Missing,
}

pub struct StatementCache {
    config: StatementCacheConfig,
    entries: Mutex<LruCache<StatementKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    on_evict: Option<EvictCallback>,
    observer: SharedObserver,
    /// Sweeper task handle. Uses std::sync::Mutex for synchronous storage.
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StatementCache {
    /// Create a cache and start its expiry sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: StatementCacheConfig) -> DbResult<Arc<Self>> {
        Self::build(config, noop(), None)
    }

    /// Create a cache with an observer and an eviction callback.
    pub fn build(
        config: StatementCacheConfig,
        observer: SharedObserver,
        on_evict: Option<EvictCallback>,
    ) -> DbResult<Arc<Self>> {
        config.validate()?;

        let capacity = NonZeroUsize::new(config.max_size).unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            on_evict,
            observer,
            sweeper: Mutex::new(None),
            config,
        });

        if cache.config.enabled {
            let weak = Arc::downgrade(&cache);
            let interval = cache.config.sweep_interval;
            let handle = tokio::spawn(async move {
                Self::sweep_task(weak, interval).await;
            });
            *lock(&cache.sweeper) = Some(handle);
        }

        Ok(cache)
    }

    /// Return a live handle for `sql`, preparing and caching one on a miss.
    ///
    /// Preparation errors are returned as-is and leave the cache untouched.
    pub async fn get<P>(&self, preparer: &mut P, sql: &str) -> DbResult<Arc<dyn PreparedStatement>>
    where
        P: StatementPreparer + ?Sized,
    {
        if !self.config.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return preparer.prepare(sql).await;
        }

        let key = StatementKey::new(preparer.kind(), sql);
        let now = Instant::now();
        let (lookup, stale) = {
            let mut entries = lock(&self.entries);
            // get_mut also moves the entry to the front of the recency list
            let lookup = match entries.get_mut(&key) {
                Some(entry)
                    if !entry.is_expired(self.config.ttl, now) && !entry.handle.is_closed() =>
                {
                    entry.hits += 1;
                    entry.last_accessed = now;
                    Lookup::Hit(Arc::clone(&entry.handle))
                }
                Some(_) => Lookup::Stale,
                None => Lookup::Missing,
            };
            let stale = match lookup {
                Lookup::Stale => entries.pop(&key),
                _ => None,
            };
            (lookup, stale)
        };

        if let Lookup::Hit(handle) = lookup {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.observer.cache_lookup("statement", true);
            return Ok(handle);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.observer.cache_lookup("statement", false);
        if let Some(entry) = stale {
            debug!(kind = %key.kind, "Prepared statement expired");
            self.discard(&key, entry, EvictionReason::Expired);
        }

        let handle = preparer.prepare(sql).await?;
        self.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Insert a handle directly, replacing any entry for the same key.
    pub fn put(&self, kind: DatabaseType, sql: &str, handle: Arc<dyn PreparedStatement>) {
        self.insert(StatementKey::new(kind, sql), handle);
    }

    /// Remove and close the handle for a key. Returns whether it was present.
    pub fn remove(&self, kind: DatabaseType, sql: &str) -> bool {
        let key = StatementKey::new(kind, sql);
        let removed = lock(&self.entries).pop(&key);
        match removed {
            Some(entry) => {
                self.discard(&key, entry, EvictionReason::Removed);
                true
            }
            None => false,
        }
    }

    /// Remove and close every handle.
    pub fn clear(&self) {
        let drained: Vec<(StatementKey, CacheEntry)> = {
            let mut entries = lock(&self.entries);
            let mut drained = Vec::with_capacity(entries.len());
            while let Some(item) = entries.pop_lru() {
                drained.push(item);
            }
            drained
        };
        for (key, entry) in drained {
            self.discard(&key, entry, EvictionReason::Cleared);
        }
    }

    /// Close every entry older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(StatementKey, CacheEntry)> = {
            let mut entries = lock(&self.entries);
            let keys: Vec<StatementKey> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(self.config.ttl, now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.pop(&key).map(|entry| (key, entry)))
                .collect()
        };
        let count = expired.len();
        for (key, entry) in expired {
            self.discard(&key, entry, EvictionReason::Expired);
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-entry hit count, without touching recency.
    pub fn entry_hits(&self, kind: DatabaseType, sql: &str) -> Option<u64> {
        lock(&self.entries)
            .peek(&StatementKey::new(kind, sql))
            .map(|entry| entry.hits)
    }

    /// Time since the entry was last handed out, without touching recency.
    pub fn entry_idle_time(&self, kind: DatabaseType, sql: &str) -> Option<Duration> {
        lock(&self.entries)
            .peek(&StatementKey::new(kind, sql))
            .map(|entry| entry.last_accessed.elapsed())
    }

    pub fn stats(&self) -> StatementCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        StatementCacheStats {
            size: self.len(),
            max_size: self.config.max_size,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
        }
    }

    /// Stop the sweeper and close every handle.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
        self.clear();
    }

    fn insert(&self, key: StatementKey, handle: Arc<dyn PreparedStatement>) {
        let displaced = lock(&self.entries).push(key.clone(), CacheEntry::new(Arc::clone(&handle)));
        if let Some((old_key, old_entry)) = displaced {
            if old_key == key {
                if !Arc::ptr_eq(&old_entry.handle, &handle) {
                    self.discard(&old_key, old_entry, EvictionReason::Replaced);
                }
            } else {
                debug!(kind = %old_key.kind, "Evicted least recently used statement");
                self.discard(&old_key, old_entry, EvictionReason::Capacity);
            }
        }
    }

    fn discard(&self, key: &StatementKey, entry: CacheEntry, reason: EvictionReason) {
        match reason {
            EvictionReason::Capacity => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            EvictionReason::Expired => {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        entry.handle.close();
        if let Some(callback) = &self.on_evict {
            callback(key, reason);
        }
    }

    /// Background task that closes expired handles.
    ///
    /// Holds only a Weak reference; exits once the cache is dropped.
    async fn sweep_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(cache) = weak.upgrade() else {
                debug!("Statement cache dropped, sweeper exiting");
                return;
            };

            let removed = cache.purge_expired();
            if removed > 0 {
                info!(removed, "Swept expired prepared statements");
            }

            drop(cache);
        }
    }
}

impl Drop for StatementCache {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("config", &self.config)
            .field("size", &self.len())
            .finish()
    }
}
