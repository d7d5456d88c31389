//! Result cache with pluggable storage and single-flight loading.
//!
//! `QueryCache::get` guarantees at most one concurrent loader per key: the
//! first caller to miss becomes the leader and registers an in-flight marker,
//! later callers wait for the marker to clear and re-read the cache. Backend
//! failures never fail a read; the cache degrades to calling the loader.

use super::hooks::TransactionHooks;
use super::lock;
use super::telemetry::{SharedObserver, noop};
use crate::config::QueryCacheConfig;
use crate::context::Context;
use crate::error::DbResult;
use crate::models::{CacheStats, QueryParam, hit_rate};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Storage behind a [`QueryCache`].
#[async_trait]
pub trait CacheBackend<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Live value for `key`; expired entries read as `None`.
    async fn get(&self, key: &str) -> DbResult<Option<V>>;

    async fn set(&self, key: &str, value: V, ttl: Duration) -> DbResult<()>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> DbResult<bool>;

    async fn clear(&self) -> DbResult<()>;

    async fn keys(&self) -> DbResult<Vec<String>>;

    fn stats(&self) -> CacheStats;
}

struct MemoryEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> MemoryEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded in-process backend.
///
/// When full, expired entries are purged first; if none expired, the entry
/// closest to expiry is evicted.
pub struct MemoryBackend<V> {
    entries: RwLock<HashMap<String, MemoryEntry<V>>>,
    capacity: usize,
    len: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> MemoryBackend<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            len: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Remove every expired entry, returning how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let removed = Self::purge_expired(&mut entries, Instant::now());
        self.len.store(entries.len(), Ordering::Relaxed);
        removed
    }

    fn purge_expired(entries: &mut HashMap<String, MemoryEntry<V>>, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

#[async_trait]
impl<V> CacheBackend<V> for MemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> DbResult<Option<V>> {
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        if expired {
            let mut entries = self.entries.write().await;
            if entries.get(key).is_some_and(|e| e.is_expired(now)) {
                entries.remove(key);
                self.len.store(entries.len(), Ordering::Relaxed);
            }
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> DbResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let purged = Self::purge_expired(&mut entries, now);
            if purged == 0 {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = victim {
                    entries.remove(&victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: now + ttl,
            },
        );
        self.len.store(entries.len(), Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> DbResult<bool> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(key).is_some();
        self.len.store(entries.len(), Ordering::Relaxed);
        Ok(removed)
    }

    async fn clear(&self) -> DbResult<()> {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.len.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn keys(&self) -> DbResult<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            entries: self.len.load(Ordering::Relaxed),
            capacity: self.capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
        }
    }
}

pub type InvalidationCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Marker for a key whose value is currently being loaded.
struct Flight {
    id: u64,
    done: watch::Receiver<()>,
}

/// Held by the leader. Dropping it clears the marker and wakes followers,
/// whether the load succeeded, failed or was cancelled.
struct FlightGuard<'a, V: Clone + Send + Sync + 'static> {
    cache: &'a QueryCache<V>,
    key: String,
    id: u64,
    _done: watch::Sender<()>,
}

impl<V: Clone + Send + Sync + 'static> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.cache.in_flight);
        if in_flight.get(&self.key).is_some_and(|f| f.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

enum Role<'a, V: Clone + Send + Sync + 'static> {
    Leader(FlightGuard<'a, V>),
    Follower(watch::Receiver<()>),
}

/// Typed result cache.
pub struct QueryCache<V: Clone + Send + Sync + 'static> {
    config: QueryCacheConfig,
    backend: Arc<dyn CacheBackend<V>>,
    in_flight: Mutex<HashMap<String, Flight>>,
    next_flight: AtomicU64,
    callbacks: Mutex<HashMap<String, Vec<InvalidationCallback>>>,
    observer: SharedObserver,
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    /// Cache backed by a [`MemoryBackend`] sized from `config.capacity`.
    pub fn new(config: QueryCacheConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new(config.capacity));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: QueryCacheConfig, backend: Arc<dyn CacheBackend<V>>) -> Self {
        Self {
            config,
            backend,
            in_flight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
            callbacks: Mutex::new(HashMap::new()),
            observer: noop(),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.config
    }

    /// Cached value for `key`, or the loader's result (stored with the
    /// configured TTL before it is returned).
    ///
    /// Loader errors are returned and never cached.
    pub async fn get<F, Fut>(&self, ctx: &Context, key: &str, loader: F) -> DbResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<V>>,
    {
        if !self.config.enabled {
            return ctx.run("query cache load", loader()).await;
        }
        ctx.check("query cache get")?;

        if let Some(value) = self.lookup(key).await {
            return Ok(value);
        }

        loop {
            match self.join_flight(key) {
                Role::Leader(guard) => {
                    // Another leader may have stored the value between our
                    // miss and registering this flight.
                    if let Some(value) = self.lookup(key).await {
                        return Ok(value);
                    }
                    let value = ctx.run("query cache load", loader()).await?;
                    self.store(key, value.clone()).await;
                    drop(guard);
                    return Ok(value);
                }
                Role::Follower(mut done) => {
                    debug!(key, "Waiting for in-flight load");
                    ctx.run("query cache wait", async {
                        // Err means the leader's guard dropped, which is the signal.
                        let _ = done.changed().await;
                        Ok(())
                    })
                    .await?;

                    if let Some(value) = self.lookup(key).await {
                        return Ok(value);
                    }
                    // Leader failed or could not store. Race the other
                    // followers for the next flight.
                }
            }
        }
    }

    fn join_flight(&self, key: &str) -> Role<'_, V> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(flight) = in_flight.get(key) {
            return Role::Follower(flight.done.clone());
        }
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(());
        in_flight.insert(key.to_string(), Flight { id, done: rx });
        Role::Leader(FlightGuard {
            cache: self,
            key: key.to_string(),
            id,
            _done: tx,
        })
    }

    async fn lookup(&self, key: &str) -> Option<V> {
        match self.backend.get(key).await {
            Ok(value) => {
                self.observer.cache_lookup("query", value.is_some());
                value
            }
            Err(e) => {
                warn!(key, error = %e, "Cache backend read failed; treating as miss");
                self.observer.cache_lookup("query", false);
                None
            }
        }
    }

    async fn store(&self, key: &str, value: V) {
        if let Err(e) = self.backend.set(key, value, self.config.ttl).await {
            warn!(key, error = %e, "Cache backend write failed");
        }
    }

    /// Store `value` under `key` with the configured TTL.
    pub async fn set(&self, key: &str, value: V) -> DbResult<()> {
        self.set_with_ttl(key, value, self.config.ttl).await
    }

    pub async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> DbResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.backend.set(key, value, ttl).await
    }

    /// Fire the invalidation callbacks for `key`, then remove it.
    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        let callbacks: Vec<InvalidationCallback> = lock(&self.callbacks)
            .get(key)
            .cloned()
            .unwrap_or_default();
        for callback in &callbacks {
            callback(key);
        }
        self.backend.delete(key).await
    }

    /// Delete every key matching a glob (`*` any run, `?` one character).
    pub async fn invalidate_pattern(&self, pattern: &str) -> DbResult<usize> {
        let keys = self.backend.keys().await?;
        let mut removed = 0;
        for key in keys.iter().filter(|k| glob_match(pattern, k)) {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        debug!(pattern, removed, "Invalidated cache entries");
        Ok(removed)
    }

    pub async fn clear(&self) -> DbResult<()> {
        self.backend.clear().await
    }

    /// Register `callback` to run whenever `key` is deleted or invalidated.
    pub fn add_invalidation_callback<F>(&self, key: &str, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.callbacks)
            .entry(key.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn stats(&self) -> CacheStats {
        self.backend.stats()
    }

    /// Number of keys with a load in progress.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Invalidate patterns recorded by committed transactions.
    ///
    /// Registers an after-commit hook on `hooks` that calls
    /// [`invalidate_pattern`](Self::invalidate_pattern) for each pattern the
    /// transaction marked with `invalidate_on_commit`.
    pub fn attach_to(self: &Arc<Self>, hooks: &TransactionHooks) {
        let cache = Arc::clone(self);
        hooks.add_after_commit_hook(move |hook_ctx| {
            let cache = Arc::clone(&cache);
            async move {
                for pattern in &hook_ctx.dirty_patterns {
                    cache.invalidate_pattern(pattern).await?;
                }
                Ok(())
            }
        });
    }
}

impl<V: Clone + Send + Sync + 'static> std::fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Cache key for a statement and its parameters: `q:` + SHA-256 hex.
pub fn cache_key(sql: &str, params: &[QueryParam]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(params).unwrap_or_default());
    format!("q:{:x}", hasher.finalize())
}

/// Glob match supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
