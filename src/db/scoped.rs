//! Transaction-scoped connections.
//!
//! Binds one pooled connection to a transaction id for the lifetime of the
//! (possibly nested) unit of work. Nested work on the same id reuses the same
//! physical connection, so savepoints apply to the same session. The entry is
//! removed and its connection returned to the pool when the reference count
//! drops to zero.

use super::driver::Connection;
use super::lock;
use super::pool::{ConnectionPool, PooledConnection};
use crate::config::ScopeConfig;
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ScopedConnectionInfo};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A pooled connection bound to a transaction id.
pub struct ScopedConnection {
    transaction_id: String,
    nest_level: u32,
    exclusive: bool,
    kind: DatabaseType,
    ref_count: AtomicUsize,
    poisoned: AtomicBool,
    conn: tokio::sync::Mutex<Option<PooledConnection>>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    last_used: Mutex<Instant>,
}

impl ScopedConnection {
    fn new(transaction_id: &str, nest_level: u32, conn: PooledConnection) -> Self {
        let now = Instant::now();
        Self {
            transaction_id: transaction_id.to_string(),
            nest_level,
            exclusive: nest_level == 0,
            kind: conn.kind(),
            ref_count: AtomicUsize::new(1),
            poisoned: AtomicBool::new(false),
            conn: tokio::sync::Mutex::new(Some(conn)),
            started_at: now,
            started_wall: Utc::now(),
            last_used: Mutex::new(now),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Nesting level of the call that created the scope.
    pub fn nest_level(&self) -> u32 {
        self.nest_level
    }

    /// True only for scopes created by an outermost transaction.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn kind(&self) -> DatabaseType {
        self.kind
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Mark the connection as unusable; it will be closed instead of recycled.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    /// Exclusive access to the underlying connection.
    pub async fn lock(&self) -> ConnectionLock<'_> {
        let guard = self.conn.lock().await;
        self.touch();
        ConnectionLock { guard }
    }

    async fn take(&self) -> Option<PooledConnection> {
        self.conn.lock().await.take()
    }
}

impl std::fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("transaction_id", &self.transaction_id)
            .field("nest_level", &self.nest_level)
            .field("exclusive", &self.exclusive)
            .field("ref_count", &self.ref_count())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

/// Locked view of a scope's connection.
pub struct ConnectionLock<'a> {
    guard: tokio::sync::MutexGuard<'a, Option<PooledConnection>>,
}

impl ConnectionLock<'_> {
    pub fn conn(&mut self) -> DbResult<&mut dyn Connection> {
        self.pooled()?.conn_mut()
    }

    pub fn pooled(&mut self) -> DbResult<&mut PooledConnection> {
        self.guard
            .as_mut()
            .ok_or_else(|| DbError::internal("scoped connection already returned to the pool"))
    }
}

#[derive(Default)]
struct ScopeState {
    scopes: HashMap<String, Arc<ScopedConnection>>,
    /// Pool acquisitions in progress for new scopes, counted against the limit.
    reserving: usize,
}

/// Registry of transaction-scoped connections.
pub struct ScopedConnectionManager {
    pool: Arc<ConnectionPool>,
    config: ScopeConfig,
    state: Mutex<ScopeState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ScopedConnectionManager {
    /// Create the registry and start its leak sweeper.
    pub fn new(pool: Arc<ConnectionPool>, config: ScopeConfig) -> DbResult<Arc<Self>> {
        config.validate()?;

        let manager = Arc::new(Self {
            pool,
            config,
            state: Mutex::new(ScopeState::default()),
            sweeper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let interval = manager.config.sweep_interval;
        let handle = tokio::spawn(async move {
            Self::sweep_task(weak, interval).await;
        });
        *lock(&manager.sweeper) = Some(handle);

        Ok(manager)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Get or create the scope for `transaction_id`.
    ///
    /// An existing scope has its reference count incremented and is returned
    /// unchanged. A new scope borrows a connection from the pool and fails
    /// with `ScopeLimit` when the configured maximum is reached.
    pub async fn acquire(
        &self,
        ctx: &Context,
        transaction_id: &str,
        nest_level: u32,
    ) -> DbResult<Arc<ScopedConnection>> {
        {
            let mut state = lock(&self.state);
            if let Some(scope) = state.scopes.get(transaction_id) {
                let refs = scope.ref_count.fetch_add(1, Ordering::AcqRel) + 1;
                scope.touch();
                debug!(transaction_id, nest_level, ref_count = refs, "Re-entered transaction scope");
                return Ok(Arc::clone(scope));
            }
            if state.scopes.len() + state.reserving >= self.config.max_scoped_connections {
                return Err(DbError::ScopeLimit {
                    limit: self.config.max_scoped_connections,
                });
            }
            state.reserving += 1;
        }

        let reservation = ScopeReservation { manager: self };
        let conn = self.pool.acquire(ctx).await?;

        let (scope, spare) = {
            let mut state = lock(&self.state);
            match state.scopes.get(transaction_id) {
                Some(scope) => {
                    scope.ref_count.fetch_add(1, Ordering::AcqRel);
                    (Arc::clone(scope), Some(conn))
                }
                None => {
                    let scope = Arc::new(ScopedConnection::new(transaction_id, nest_level, conn));
                    state.scopes.insert(transaction_id.to_string(), Arc::clone(&scope));
                    (scope, None)
                }
            }
        };
        drop(reservation);

        match spare {
            Some(conn) => self.pool.release(conn).await?,
            None => debug!(
                transaction_id,
                nest_level,
                exclusive = scope.exclusive,
                "Transaction scope opened"
            ),
        }
        Ok(scope)
    }

    /// Drop one reference to the scope for `transaction_id`.
    ///
    /// At zero the scope is removed and its connection returned to the pool
    /// (closed instead if the scope was poisoned).
    pub async fn release(&self, transaction_id: &str) -> DbResult<()> {
        let finished = {
            let mut state = lock(&self.state);
            let Some(scope) = state.scopes.get(transaction_id) else {
                return Err(DbError::transaction(
                    "No scoped connection for transaction",
                    transaction_id,
                ));
            };
            let refs = scope.ref_count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
            scope.touch();
            if refs == 0 {
                state.scopes.remove(transaction_id)
            } else {
                debug!(transaction_id, ref_count = refs, "Left nested transaction scope");
                None
            }
        };

        match finished {
            Some(scope) => {
                debug!(transaction_id, "Transaction scope closed");
                self.reclaim(scope).await
            }
            None => Ok(()),
        }
    }

    /// Synchronously give up one reference after the owning work was dropped
    /// mid-flight.
    ///
    /// The connection may still have an open transaction, so the scope is
    /// poisoned; the sweeper closes it once nothing references it.
    pub fn abandon(&self, transaction_id: &str) {
        let state = lock(&self.state);
        if let Some(scope) = state.scopes.get(transaction_id) {
            let _ = scope
                .ref_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            scope.poison();
            warn!(
                transaction_id,
                ref_count = scope.ref_count(),
                "Transaction scope abandoned; connection will be discarded"
            );
        }
    }

    pub fn get(&self, transaction_id: &str) -> Option<Arc<ScopedConnection>> {
        lock(&self.state).scopes.get(transaction_id).cloned()
    }

    pub fn count(&self) -> usize {
        lock(&self.state).scopes.len()
    }

    /// Metadata for every live scope.
    pub fn list_all(&self) -> Vec<ScopedConnectionInfo> {
        let state = lock(&self.state);
        state
            .scopes
            .values()
            .map(|scope| ScopedConnectionInfo {
                transaction_id: scope.transaction_id.clone(),
                nest_level: scope.nest_level,
                ref_count: scope.ref_count(),
                exclusive: scope.exclusive,
                poisoned: scope.is_poisoned(),
                kind: scope.kind,
                started_at: scope.started_wall,
                idle_secs: scope.idle_time().as_secs(),
            })
            .collect()
    }

    /// Reclaim unreferenced scopes that are poisoned or idle past the
    /// threshold. Returns how many were reclaimed.
    pub async fn sweep(&self) -> usize {
        let stale: Vec<Arc<ScopedConnection>> = {
            let mut state = lock(&self.state);
            let ids: Vec<String> = state
                .scopes
                .iter()
                .filter(|(_, scope)| {
                    scope.ref_count() == 0
                        && (scope.is_poisoned() || scope.idle_time() > self.config.idle_threshold)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.scopes.remove(id))
                .collect()
        };

        let count = stale.len();
        for scope in stale {
            warn!(
                transaction_id = %scope.transaction_id,
                poisoned = scope.is_poisoned(),
                age_secs = scope.age().as_secs(),
                "Reclaiming leaked transaction scope"
            );
            if let Err(e) = self.reclaim(scope).await {
                warn!(error = %e, "Failed to reclaim transaction scope");
            }
        }
        count
    }

    /// Stop the sweeper and close every remaining scope's connection.
    pub async fn close(&self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
        let scopes: Vec<Arc<ScopedConnection>> = lock(&self.state).scopes.drain().map(|(_, s)| s).collect();
        for scope in scopes {
            scope.poison();
            if let Err(e) = self.reclaim(scope).await {
                warn!(error = %e, "Failed to close transaction scope");
            }
        }
    }

    async fn reclaim(&self, scope: Arc<ScopedConnection>) -> DbResult<()> {
        let Some(mut conn) = scope.take().await else {
            return Ok(());
        };
        if scope.is_poisoned() {
            conn.mark_unhealthy();
        }
        self.pool.release(conn).await
    }

    async fn sweep_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(manager) = weak.upgrade() else {
                debug!("Scope registry dropped, sweeper exiting");
                return;
            };

            let reclaimed = manager.sweep().await;
            if reclaimed > 0 {
                info!(reclaimed, "Transaction scope sweep reclaimed connections");
            }

            drop(manager);
        }
    }
}

impl Drop for ScopedConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ScopedConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedConnectionManager")
            .field("config", &self.config)
            .field("scopes", &self.count())
            .finish()
    }
}

/// Counts an in-progress scope creation against the limit until dropped.
struct ScopeReservation<'a> {
    manager: &'a ScopedConnectionManager,
}

impl Drop for ScopeReservation<'_> {
    fn drop(&mut self) {
        lock(&self.manager.state).reserving -= 1;
    }
}
