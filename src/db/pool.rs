//! Bounded, health-checked connection pool.
//!
//! The pool owns idle connections and tracks borrowed ones by id. At every
//! observation point `idle + borrowed + pending <= max_connections`, where
//! `pending` counts connections being opened or health-checked.
//!
//! Waiters park on a [`Notify`] and are woken whenever capacity frees up.
//! All bookkeeping happens under one `std::sync::Mutex` that is never held
//! across an await; connections are opened and closed outside the lock.

use super::driver::{Connection, Connector};
use super::lock;
use super::telemetry::{SharedObserver, noop};
use crate::config::PoolConfig;
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionInfo, DatabaseType, PoolStats};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reason a connection is closed instead of recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleReason {
    /// Connection exceeded max lifetime
    LifetimeExpired,
    /// Connection exceeded idle timeout
    IdleExpired,
    /// Health flag cleared by a failed check or by the borrower
    Unhealthy,
    /// Idle queue already full
    QueueFull,
    PoolClosed,
}

#[derive(Debug, Clone)]
struct ConnMeta {
    id: u64,
    kind: DatabaseType,
    created_at: Instant,
    created_wall: chrono::DateTime<chrono::Utc>,
    last_used_at: Instant,
    borrow_count: u64,
    healthy: bool,
}

struct IdleSlot {
    conn: Box<dyn Connection>,
    meta: ConnMeta,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleSlot>,
    borrowed: HashSet<u64>,
    pending: usize,
    closed: bool,
}

impl PoolState {
    fn open(&self) -> usize {
        self.idle.len() + self.borrowed.len() + self.pending
    }
}

/// Lock-free counters; eventually consistent.
#[derive(Debug, Default)]
struct AtomicPoolStats {
    created: AtomicU64,
    closed: AtomicU64,
    borrows: AtomicU64,
    returns: AtomicU64,
    errors: AtomicU64,
    lifetime_expired: AtomicU64,
    idle_expired: AtomicU64,
    unhealthy: AtomicU64,
    health_checks: AtomicU64,
}

impl AtomicPoolStats {
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_recycle(&self, reason: RecycleReason) {
        match reason {
            RecycleReason::LifetimeExpired => Self::record(&self.lifetime_expired),
            RecycleReason::IdleExpired => Self::record(&self.idle_expired),
            RecycleReason::Unhealthy => Self::record(&self.unhealthy),
            RecycleReason::QueueFull | RecycleReason::PoolClosed => {}
        }
    }
}

enum Step {
    Reuse(IdleSlot),
    Create,
    Wait,
}

pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    kind: DatabaseType,
    state: Mutex<PoolState>,
    available: Notify,
    next_id: AtomicU64,
    stats: AtomicPoolStats,
    observer: SharedObserver,
    /// Health worker handle. Uses std::sync::Mutex for synchronous storage.
    health_worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Open `min_connections` connections and start the health worker.
    pub async fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> DbResult<Arc<Self>> {
        Self::with_observer(config, connector, noop()).await
    }

    pub async fn with_observer(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        observer: SharedObserver,
    ) -> DbResult<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new(Self {
            kind: connector.kind(),
            connector,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            stats: AtomicPoolStats::default(),
            observer,
            health_worker: Mutex::new(None),
            config,
        });

        for _ in 0..pool.config.min_connections {
            let conn = pool.connector.connect().await?;
            let meta = pool.new_meta();
            AtomicPoolStats::record(&pool.stats.created);
            lock(&pool.state).idle.push_back(IdleSlot { conn, meta });
        }

        // Weak reference so the worker never keeps the pool alive
        let weak = Arc::downgrade(&pool);
        let interval = pool.config.health_check_interval;
        let handle = tokio::spawn(async move {
            Self::health_task(weak, interval).await;
        });
        *lock(&pool.health_worker) = Some(handle);

        info!(
            kind = %pool.kind,
            min = pool.config.min_connections,
            max = pool.config.max_connections,
            "Connection pool opened"
        );
        Ok(pool)
    }

    pub fn kind(&self) -> DatabaseType {
        self.kind
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a connection.
    ///
    /// Waits up to the smaller of `acquire_timeout` and the time left on
    /// `ctx`. Pool exhaustion yields `Timeout`; the context yields
    /// `DeadlineExceeded` or `Cancelled`. Nothing is held on failure.
    pub async fn acquire(self: &Arc<Self>, ctx: &Context) -> DbResult<PooledConnection> {
        const OP: &str = "connection acquire";
        let start = Instant::now();
        let pool_deadline = start + self.config.acquire_timeout;
        let (wait_until, ctx_bound) = match ctx.deadline() {
            Some(at) if at < pool_deadline => (at, true),
            _ => (pool_deadline, false),
        };
        let expired = |start: Instant| {
            if ctx_bound {
                DbError::deadline_exceeded(OP)
            } else {
                DbError::timeout(OP, start.elapsed().as_millis() as u64)
            }
        };

        if let Err(e) = ctx.check(OP) {
            AtomicPoolStats::record(&self.stats.errors);
            return Err(e);
        }

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (step, stale) = {
                let mut state = lock(&self.state);
                if state.closed {
                    drop(state);
                    AtomicPoolStats::record(&self.stats.errors);
                    return Err(DbError::PoolClosed);
                }

                let mut stale = Vec::new();
                let mut found = None;
                while let Some(slot) = state.idle.pop_front() {
                    if let Some(reason) = self.recycle_reason(&slot.meta, now) {
                        stale.push((slot, reason));
                        continue;
                    }
                    state.borrowed.insert(slot.meta.id);
                    found = Some(slot);
                    break;
                }

                let step = match found {
                    Some(slot) => Step::Reuse(slot),
                    None if state.open() < self.config.max_connections => {
                        state.pending += 1;
                        Step::Create
                    }
                    None => Step::Wait,
                };
                (step, stale)
            };

            for (slot, reason) in stale {
                debug!(connection_id = slot.meta.id, ?reason, "Discarding stale idle connection");
                self.stats.record_recycle(reason);
                self.close_connection(slot.conn, slot.meta.id).await;
            }

            match step {
                Step::Reuse(IdleSlot { conn, mut meta }) => {
                    meta.borrow_count += 1;
                    meta.last_used_at = Instant::now();
                    return Ok(self.hand_out(conn, meta, start));
                }
                Step::Create => {
                    let reservation = Reservation { pool: self };
                    let result = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => Err(DbError::cancelled(OP)),
                        _ = tokio::time::sleep_until(wait_until) => Err(expired(start)),
                        conn = self.connector.connect() => conn,
                    };
                    let conn = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            drop(reservation);
                            AtomicPoolStats::record(&self.stats.errors);
                            warn!(kind = %self.kind, error = %e, "Failed to open connection");
                            return Err(e);
                        }
                    };
                    AtomicPoolStats::record(&self.stats.created);

                    let mut meta = self.new_meta();
                    meta.borrow_count = 1;
                    let accepted = {
                        let mut state = lock(&self.state);
                        reservation.commit(&mut state);
                        if state.closed {
                            false
                        } else {
                            state.borrowed.insert(meta.id);
                            true
                        }
                    };
                    if !accepted {
                        self.close_connection(conn, meta.id).await;
                        AtomicPoolStats::record(&self.stats.errors);
                        return Err(DbError::PoolClosed);
                    }
                    debug!(connection_id = meta.id, "Opened new pooled connection");
                    return Ok(self.hand_out(conn, meta, start));
                }
                Step::Wait => {
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => {
                            AtomicPoolStats::record(&self.stats.errors);
                            return Err(DbError::cancelled(OP));
                        }
                        _ = tokio::time::sleep_until(wait_until) => {
                            AtomicPoolStats::record(&self.stats.errors);
                            debug!(kind = %self.kind, "Timed out waiting for a connection");
                            return Err(expired(start));
                        }
                        _ = &mut notified => continue,
                    }
                }
            }
        }
    }

    /// Return a borrowed connection.
    ///
    /// Connections past their lifetime or idle limit, flagged unhealthy, or
    /// released after `close()` are closed instead of recycled.
    pub async fn release(&self, mut conn: PooledConnection) -> DbResult<()> {
        if !std::ptr::eq(conn.pool.as_ptr(), self) {
            return Err(DbError::invalid_input(format!(
                "connection {} does not belong to this pool",
                conn.meta.id
            )));
        }
        let Some(inner) = conn.conn.take() else {
            return Ok(());
        };
        self.return_connection(inner, conn.meta.clone()).await
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, mut meta: ConnMeta) -> DbResult<()> {
        let now = Instant::now();
        let outcome = {
            let mut state = lock(&self.state);
            if !state.borrowed.remove(&meta.id) {
                Err(conn)
            } else {
                let reason = if state.closed {
                    Some(RecycleReason::PoolClosed)
                } else if !meta.healthy {
                    Some(RecycleReason::Unhealthy)
                } else if state.idle.len() >= self.config.max_connections {
                    Some(RecycleReason::QueueFull)
                } else {
                    self.recycle_reason(&meta, now)
                };
                match reason {
                    Some(reason) => Ok(Some((conn, reason))),
                    None => {
                        meta.last_used_at = now;
                        state.idle.push_back(IdleSlot { conn, meta: meta.clone() });
                        Ok(None)
                    }
                }
            }
        };

        match outcome {
            Err(conn) => {
                self.close_connection(conn, meta.id).await;
                Err(DbError::internal(format!(
                    "connection {} was not borrowed from this pool",
                    meta.id
                )))
            }
            Ok(None) => {
                AtomicPoolStats::record(&self.stats.returns);
                self.observer.connection_released(self.kind, true);
                self.available.notify_one();
                Ok(())
            }
            Ok(Some((conn, reason))) => {
                AtomicPoolStats::record(&self.stats.returns);
                self.stats.record_recycle(reason);
                debug!(connection_id = meta.id, ?reason, "Closing released connection");
                self.close_connection(conn, meta.id).await;
                self.observer.connection_released(self.kind, false);
                self.available.notify_one();
                Ok(())
            }
        }
    }

    /// Validate every idle connection once.
    ///
    /// Idle connections are drained, probed with the validation query under a
    /// short timeout, and the healthy ones requeued. The pool is then topped
    /// back up to `min_connections`. Returns how many were discarded.
    pub async fn run_health_check(&self) -> usize {
        let mut batch = {
            let mut state = lock(&self.state);
            if state.closed {
                return 0;
            }
            let slots: VecDeque<IdleSlot> = state.idle.drain(..).collect();
            state.pending += slots.len();
            HealthBatch { pool: self, slots }
        };

        let mut discarded = 0;
        while let Some(slot) = batch.slots.front_mut() {
            AtomicPoolStats::record(&self.stats.health_checks);
            let reason = match self.recycle_reason(&slot.meta, Instant::now()) {
                Some(reason) => Some(reason),
                None => {
                    let probe = tokio::time::timeout(
                        self.config.health_check_timeout,
                        slot.conn.validate(&self.config.validation_query),
                    )
                    .await;
                    match probe {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => {
                            warn!(connection_id = slot.meta.id, error = %e, "Health check failed");
                            Some(RecycleReason::Unhealthy)
                        }
                        Err(_) => {
                            warn!(connection_id = slot.meta.id, "Health check timed out");
                            Some(RecycleReason::Unhealthy)
                        }
                    }
                }
            };

            let requeue = {
                let mut state = lock(&self.state);
                let Some(IdleSlot { conn, mut meta }) = batch.slots.pop_front() else {
                    break;
                };
                state.pending -= 1;
                match reason {
                    None if !state.closed => {
                        state.idle.push_back(IdleSlot { conn, meta });
                        None
                    }
                    None => Some((conn, meta, RecycleReason::PoolClosed)),
                    Some(reason) => {
                        meta.healthy = false;
                        Some((conn, meta, reason))
                    }
                }
            };
            match requeue {
                None => self.available.notify_one(),
                Some((conn, meta, reason)) => {
                    discarded += 1;
                    self.stats.record_recycle(reason);
                    self.close_connection(conn, meta.id).await;
                    self.available.notify_one();
                }
            }
        }

        self.replenish().await;
        discarded
    }

    /// Open connections until `min_connections` are open again.
    async fn replenish(&self) {
        loop {
            {
                let mut state = lock(&self.state);
                if state.closed || state.open() >= self.config.min_connections {
                    return;
                }
                state.pending += 1;
            }
            let reservation = Reservation { pool: self };
            match self.connector.connect().await {
                Ok(conn) => {
                    AtomicPoolStats::record(&self.stats.created);
                    let meta = self.new_meta();
                    let rejected = {
                        let mut state = lock(&self.state);
                        reservation.commit(&mut state);
                        if state.closed {
                            Some(conn)
                        } else {
                            state.idle.push_back(IdleSlot { conn, meta: meta.clone() });
                            None
                        }
                    };
                    match rejected {
                        Some(conn) => {
                            self.close_connection(conn, meta.id).await;
                            return;
                        }
                        None => self.available.notify_one(),
                    }
                }
                Err(e) => {
                    drop(reservation);
                    AtomicPoolStats::record(&self.stats.errors);
                    warn!(kind = %self.kind, error = %e, "Failed to replenish pool");
                    return;
                }
            }
        }
    }

    /// Stop the health worker, close idle connections and refuse new borrows.
    ///
    /// Connections still borrowed are closed when they come back.
    pub async fn close(&self) {
        if let Some(handle) = lock(&self.health_worker).take() {
            handle.abort();
        }

        let idle: Vec<IdleSlot> = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };

        for slot in idle {
            self.close_connection(slot.conn, slot.meta.id).await;
        }
        self.available.notify_waiters();
        info!(kind = %self.kind, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, borrowed, pending, closed_pool) = {
            let state = lock(&self.state);
            (state.idle.len(), state.borrowed.len(), state.pending, state.closed)
        };
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolStats {
            max_connections: self.config.max_connections,
            idle,
            borrowed,
            pending,
            created: load(&self.stats.created),
            closed: load(&self.stats.closed),
            borrows: load(&self.stats.borrows),
            returns: load(&self.stats.returns),
            errors: load(&self.stats.errors),
            lifetime_expired: load(&self.stats.lifetime_expired),
            idle_expired: load(&self.stats.idle_expired),
            unhealthy: load(&self.stats.unhealthy),
            health_checks: load(&self.stats.health_checks),
            closed_pool,
        }
    }

    fn recycle_reason(&self, meta: &ConnMeta, now: Instant) -> Option<RecycleReason> {
        if now.saturating_duration_since(meta.created_at) > self.config.max_lifetime {
            Some(RecycleReason::LifetimeExpired)
        } else if now.saturating_duration_since(meta.last_used_at) > self.config.max_idle_time {
            Some(RecycleReason::IdleExpired)
        } else {
            None
        }
    }

    fn new_meta(&self) -> ConnMeta {
        let now = Instant::now();
        ConnMeta {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: self.kind,
            created_at: now,
            created_wall: chrono::Utc::now(),
            last_used_at: now,
            borrow_count: 0,
            healthy: true,
        }
    }

    fn hand_out(self: &Arc<Self>, conn: Box<dyn Connection>, meta: ConnMeta, start: Instant) -> PooledConnection {
        AtomicPoolStats::record(&self.stats.borrows);
        self.observer.connection_acquired(self.kind, start.elapsed());
        PooledConnection {
            conn: Some(conn),
            meta,
            pool: Arc::downgrade(self),
        }
    }

    async fn close_connection(&self, mut conn: Box<dyn Connection>, id: u64) {
        if let Err(e) = conn.close().await {
            warn!(connection_id = id, error = %e, "Error closing connection");
        }
        AtomicPoolStats::record(&self.stats.closed);
    }

    /// Background health worker.
    ///
    /// Holds only a Weak reference; exits once the pool is dropped.
    async fn health_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(pool) = weak.upgrade() else {
                debug!("Connection pool dropped, health worker exiting");
                return;
            };

            let discarded = pool.run_health_check().await;
            if discarded > 0 {
                info!(kind = %pool.kind, discarded, "Health check discarded connections");
            }

            drop(pool);
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.health_worker).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A creation slot counted in `pending`; released on drop unless committed.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
}

impl Reservation<'_> {
    fn commit(self, state: &mut PoolState) {
        state.pending -= 1;
        std::mem::forget(self);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(&self.pool.state).pending -= 1;
        self.pool.available.notify_one();
    }
}

/// Idle connections taken out for a health check.
///
/// Slots still held on drop belong to an interrupted check: their
/// reservations are returned and the connections closed in the background.
struct HealthBatch<'a> {
    pool: &'a ConnectionPool,
    slots: VecDeque<IdleSlot>,
}

impl Drop for HealthBatch<'_> {
    fn drop(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        lock(&self.pool.state).pending -= self.slots.len();
        let handle = tokio::runtime::Handle::try_current().ok();
        for IdleSlot { mut conn, meta } in self.slots.drain(..) {
            self.pool.stats.record_recycle(RecycleReason::PoolClosed);
            AtomicPoolStats::record(&self.pool.stats.closed);
            match &handle {
                Some(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = conn.close().await {
                            warn!(connection_id = meta.id, error = %e, "Error closing connection");
                        }
                    });
                }
                None => warn!(
                    connection_id = meta.id,
                    "Tokio runtime unavailable during drop; connection discarded"
                ),
            }
        }
        self.pool.available.notify_one();
    }
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Return it with [`ConnectionPool::release`] or [`PooledConnection::release`].
/// Dropping it instead spawns the release on the current runtime and logs a
/// warning.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    meta: ConnMeta,
    pool: Weak<ConnectionPool>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn kind(&self) -> DatabaseType {
        self.meta.kind
    }

    pub fn borrow_count(&self) -> u64 {
        self.meta.borrow_count
    }

    pub fn age(&self) -> Duration {
        self.meta.created_at.elapsed()
    }

    pub fn last_used_at(&self) -> Instant {
        self.meta.last_used_at
    }

    pub fn is_healthy(&self) -> bool {
        self.meta.healthy
    }

    /// Make the pool close this connection on release instead of recycling it.
    pub fn mark_unhealthy(&mut self) {
        self.meta.healthy = false;
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.meta.id,
            kind: self.meta.kind,
            created_at: self.meta.created_wall,
            borrow_count: self.meta.borrow_count,
            healthy: self.meta.healthy,
        }
    }

    /// The underlying driver connection.
    pub fn conn_mut(&mut self) -> DbResult<&mut dyn Connection> {
        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(DbError::internal("pooled connection already released")),
        }
    }

    /// Return this connection to its pool.
    pub async fn release(mut self) -> DbResult<()> {
        let Some(pool) = self.pool.upgrade() else {
            if let Some(mut conn) = self.conn.take() {
                conn.close().await?;
            }
            return Ok(());
        };
        pool.release(self).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let meta = self.meta.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    connection_id = meta.id,
                    "Connection released via Drop - consider using explicit release()"
                );
                handle.spawn(async move {
                    if let Err(e) = pool.return_connection(conn, meta).await {
                        warn!(error = %e, "Drop-based connection release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    connection_id = meta.id,
                    "Tokio runtime unavailable during drop; connection discarded"
                );
                let mut state = lock(&pool.state);
                state.borrowed.remove(&meta.id);
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.meta.id)
            .field("kind", &self.meta.kind)
            .field("borrow_count", &self.meta.borrow_count)
            .field("healthy", &self.meta.healthy)
            .field("released", &self.conn.is_none())
            .finish()
    }
}
