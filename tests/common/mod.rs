//! Shared in-memory driver for integration tests.
//!
//! `MockConnector` hands out `MockConnection`s that record every statement
//! with the id of the connection that ran it. Switches on `MockState` make
//! connects, validation, commit, rollback or marked statements fail, and
//! `stall_validate` makes validation hang.

#![allow(dead_code)]

use async_trait::async_trait;
use db_runtime::config::{
    PoolConfig, RetryConfig, ScopeConfig, StatementCacheConfig, TransactionConfig,
};
use db_runtime::db::{
    Connection, ConnectionPool, Connector, PreparedStatement, ScopedConnectionManager,
    StatementCache, StatementPreparer, TransactionHooks, TransactionManager,
};
use db_runtime::models::{DatabaseType, JsonRow, QueryParam};
use db_runtime::{DbError, DbResult};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct MockState {
    next_id: AtomicU64,
    pub connects: AtomicU64,
    pub closes: AtomicU64,
    pub prepares: AtomicU64,
    pub validations: AtomicU64,
    pub fail_connect: AtomicBool,
    pub fail_validate: AtomicBool,
    /// Validation hangs until the caller gives up.
    pub stall_validate: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    /// Statements containing this text fail with a deadlock error.
    pub deadlock_on: Mutex<Option<String>>,
    log: Mutex<Vec<(u64, String)>>,
    rows: Mutex<HashMap<String, i64>>,
}

impl MockState {
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }

    /// Connection ids that ran a statement starting with `prefix`.
    pub fn connections_for(&self, prefix: &str) -> Vec<u64> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.starts_with(prefix))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn count(&self, sql: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|(_, s)| s == sql).count()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn deadlock_on(&self, fragment: &str) {
        *self.deadlock_on.lock().unwrap() = Some(fragment.to_string());
    }

    pub fn open_connections(&self) -> u64 {
        self.connects.load(Ordering::SeqCst) - self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "is the server up?"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            id,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

#[derive(Debug)]
pub struct MockStatement {
    sql: String,
    closed: AtomicBool,
}

impl PreparedStatement for MockStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MockConnection {
    id: u64,
    state: Arc<MockState>,
    closed: bool,
}

impl MockConnection {
    fn record(&self, sql: &str) -> DbResult<()> {
        if self.closed {
            return Err(DbError::connection("connection is closed", ""));
        }
        self.state.log.lock().unwrap().push((self.id, sql.to_string()));

        let upper = sql.to_ascii_uppercase();
        if upper == "COMMIT" && self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::database("commit refused", Some("23000".into()), ""));
        }
        if upper == "ROLLBACK" && self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection reset by peer", ""));
        }
        if let Some(fragment) = self.state.deadlock_on.lock().unwrap().as_deref() {
            if sql.contains(fragment) {
                return Err(DbError::database("deadlock detected", Some("40P01".into()), ""));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StatementPreparer for MockConnection {
    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn prepare(&mut self, sql: &str) -> DbResult<Arc<dyn PreparedStatement>> {
        if sql.contains("SYNTAX ERROR") {
            return Err(DbError::database("near \"SYNTAX\": syntax error", Some("1".into()), ""));
        }
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockStatement {
            sql: sql.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
        self.record(sql)?;
        Ok(1)
    }

    async fn query(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        self.record(sql)?;
        let n = *self.state.rows.lock().unwrap().entry(sql.to_string()).or_insert(0);
        let mut row = JsonRow::new();
        row.insert("n".to_string(), n.into());
        row.insert("connection".to_string(), (self.id as i64).into());
        Ok(vec![row])
    }

    async fn validate(&mut self, _query: &str) -> DbResult<()> {
        self.state.validations.fetch_add(1, Ordering::SeqCst);
        if self.state.stall_validate.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.closed || self.state.fail_validate.load(Ordering::SeqCst) {
            return Err(DbError::connection("server has gone away", ""));
        }
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        if !self.closed {
            self.closed = true;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub fn pool_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_connections: min,
        max_connections: max,
        acquire_timeout: Duration::from_secs(1),
        max_lifetime: Duration::from_secs(3600),
        max_idle_time: Duration::from_secs(600),
        health_check_interval: Duration::from_secs(3600),
        health_check_timeout: Duration::from_millis(200),
        validation_query: "SELECT 1".to_string(),
    }
}

pub fn retry_config(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
    }
}

/// Everything a transaction test needs, over a mock driver.
pub struct Harness {
    pub connector: MockConnector,
    pub pool: Arc<ConnectionPool>,
    pub statements: Arc<StatementCache>,
    pub scopes: Arc<ScopedConnectionManager>,
    pub manager: TransactionManager,
}

impl Harness {
    pub async fn new(max_retries: u32) -> Self {
        Self::with_scope(max_retries, ScopeConfig::default()).await
    }

    pub async fn with_scope(max_retries: u32, scope: ScopeConfig) -> Self {
        let connector = MockConnector::new();
        let pool = ConnectionPool::new(pool_config(1, 4), Arc::new(connector.clone()))
            .await
            .unwrap();
        let statements = StatementCache::new(StatementCacheConfig::default()).unwrap();
        let scopes = ScopedConnectionManager::new(Arc::clone(&pool), scope).unwrap();
        let manager = TransactionManager::new(
            Arc::clone(&scopes),
            Arc::clone(&statements),
            Arc::new(TransactionHooks::new()),
            TransactionConfig {
                retry: retry_config(max_retries),
                ..TransactionConfig::default()
            },
        );
        Self {
            connector,
            pool,
            statements,
            scopes,
            manager,
        }
    }

    pub fn state(&self) -> &MockState {
        &self.connector.state
    }
}
