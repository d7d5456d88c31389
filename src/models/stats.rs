//! Statistics snapshots exposed by the pool and the caches.

use serde::Serialize;

/// Pool counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub idle: usize,
    pub borrowed: usize,
    /// Connections currently being opened or health-checked.
    pub pending: usize,
    pub created: u64,
    pub closed: u64,
    pub borrows: u64,
    pub returns: u64,
    pub errors: u64,
    pub lifetime_expired: u64,
    pub idle_expired: u64,
    pub unhealthy: u64,
    pub health_checks: u64,
    pub closed_pool: bool,
}

impl PoolStats {
    /// Connections counted against `max_connections`.
    pub fn open(&self) -> usize {
        self.idle + self.borrowed + self.pending
    }
}

/// Statement cache counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatementCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

/// Query cache backend counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Compute a hit rate, 0.0 when there were no lookups.
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
