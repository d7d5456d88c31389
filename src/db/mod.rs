//! Database runtime components.
//!
//! - [`pool`]: bounded, health-checked connection pool
//! - [`statement_cache`]: LRU + TTL cache of prepared statements
//! - [`query_cache`]: typed result cache with single-flight loading
//! - [`scoped`]: connections bound to a transaction id
//! - [`transaction`]: retrying transactions with hooks and savepoints
//! - [`sqlite`]: reference driver over sqlx

pub mod driver;
pub mod hooks;
pub mod params;
pub mod pool;
pub mod query_cache;
pub mod retry;
pub mod runtime;
pub mod scoped;
pub mod sqlite;
pub mod statement_cache;
pub mod telemetry;
pub mod transaction;
pub mod types;

pub use driver::{Connection, Connector, PreparedStatement, StatementPreparer};
pub use hooks::{HookContext, HookPhase, TransactionHooks};
pub use pool::{ConnectionPool, PooledConnection, RecycleReason};
pub use query_cache::{CacheBackend, MemoryBackend, QueryCache, cache_key};
pub use retry::RetryPolicy;
pub use runtime::DbRuntime;
pub use scoped::{ScopedConnection, ScopedConnectionManager};
pub use sqlite::SqliteConnector;
pub use statement_cache::{EvictionReason, StatementCache, StatementKey};
pub use telemetry::{NoopObserver, Observer, SharedObserver, TracingObserver};
pub use transaction::{ManagedTransaction, TransactionManager};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock_read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock_write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}
