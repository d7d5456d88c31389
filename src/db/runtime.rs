//! One-stop wiring of the runtime components for a single database.

use super::driver::Connector;
use super::hooks::TransactionHooks;
use super::lock;
use super::pool::{ConnectionPool, PooledConnection};
use super::query_cache::QueryCache;
use super::scoped::ScopedConnectionManager;
use super::sqlite::SqliteConnector;
use super::statement_cache::StatementCache;
use super::telemetry::{SharedObserver, noop};
use super::transaction::TransactionManager;
use crate::config::{DatabaseConfig, RuntimeConfig};
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, JsonRow, QueryParam};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Pool, statement cache, scoped connections and transaction manager for
/// one logical database.
pub struct DbRuntime {
    config: RuntimeConfig,
    pool: Arc<ConnectionPool>,
    statements: Arc<StatementCache>,
    scopes: Arc<ScopedConnectionManager>,
    transactions: TransactionManager,
    observer: SharedObserver,
    /// One query cache per value type, each attached to the hooks once.
    query_caches: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DbRuntime {
    pub async fn open(config: RuntimeConfig, connector: Arc<dyn Connector>) -> DbResult<Self> {
        Self::with_observer(config, connector, noop()).await
    }

    pub async fn with_observer(
        config: RuntimeConfig,
        connector: Arc<dyn Connector>,
        observer: SharedObserver,
    ) -> DbResult<Self> {
        config.validate()?;

        let pool = ConnectionPool::with_observer(config.pool.clone(), connector, observer.clone()).await?;
        let statements = StatementCache::build(config.statements.clone(), observer.clone(), None)?;
        let scopes = ScopedConnectionManager::new(Arc::clone(&pool), config.scope.clone())?;
        let transactions = TransactionManager::new(
            Arc::clone(&scopes),
            Arc::clone(&statements),
            Arc::new(TransactionHooks::new()),
            config.transaction.clone(),
        )
        .with_observer(observer.clone());

        info!(
            kind = %pool.kind(),
            statement_cache = config.statements.max_size,
            max_retries = config.transaction.retry.max_retries,
            "Database runtime ready"
        );

        Ok(Self {
            config,
            pool,
            statements,
            scopes,
            transactions,
            observer,
            query_caches: Mutex::new(HashMap::new()),
        })
    }

    /// Open a runtime for a parsed connection string using a bundled driver.
    pub async fn connect(
        db: &DatabaseConfig,
        config: RuntimeConfig,
        observer: SharedObserver,
    ) -> DbResult<Self> {
        let connector: Arc<dyn Connector> =
            match DatabaseType::from_connection_string(&db.connection_string) {
                Some(DatabaseType::SQLite) => Arc::new(SqliteConnector::new(&db.connection_string)?),
                Some(other) => {
                    return Err(DbError::invalid_input(format!(
                        "No bundled driver for {}; supply a Connector",
                        other.display_name()
                    )));
                }
                None => {
                    return Err(DbError::invalid_input(
                        "Unrecognized connection string scheme",
                    ));
                }
            };
        Self::with_observer(config, connector, observer).await
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn statements(&self) -> &Arc<StatementCache> {
        &self.statements
    }

    pub fn scopes(&self) -> &Arc<ScopedConnectionManager> {
        &self.scopes
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn hooks(&self) -> &Arc<TransactionHooks> {
        self.transactions.hooks()
    }

    /// The query cache for values of type `V`, invalidated by this runtime's
    /// committed transactions (see `ManagedTransaction::invalidate_on_commit`).
    ///
    /// Every call for the same `V` returns the same cache.
    pub fn query_cache<V: Clone + Send + Sync + 'static>(&self) -> Arc<QueryCache<V>> {
        let mut caches = lock(&self.query_caches);
        if let Some(cache) = caches
            .get(&TypeId::of::<V>())
            .and_then(|any| Arc::clone(any).downcast::<QueryCache<V>>().ok())
        {
            return cache;
        }
        let cache = Arc::new(
            QueryCache::new(self.config.query_cache.clone()).with_observer(self.observer.clone()),
        );
        cache.attach_to(self.hooks());
        caches.insert(TypeId::of::<V>(), Arc::clone(&cache) as Arc<dyn Any + Send + Sync>);
        cache
    }

    pub async fn execute_in_transaction<T, F, Fut>(&self, ctx: &Context, work: F) -> DbResult<T>
    where
        F: FnMut(Context) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        self.transactions.execute_in_transaction(ctx, work).await
    }

    pub async fn acquire(&self, ctx: &Context) -> DbResult<PooledConnection> {
        self.pool.acquire(ctx).await
    }

    pub async fn release(&self, conn: PooledConnection) -> DbResult<()> {
        self.pool.release(conn).await
    }

    /// Run a query outside any transaction through the statement cache.
    pub async fn query(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        let mut pooled = self.pool.acquire(ctx).await?;
        let result = ctx
            .run("query", async {
                let conn = pooled.conn_mut()?;
                let stmt = self.statements.get(&mut *conn, sql).await?;
                conn.query_prepared(&stmt, params).await
            })
            .await;
        self.finish(pooled, result).await
    }

    /// Execute a statement outside any transaction through the statement cache.
    pub async fn execute(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let mut pooled = self.pool.acquire(ctx).await?;
        let result = ctx
            .run("execute", async {
                let conn = pooled.conn_mut()?;
                let stmt = self.statements.get(&mut *conn, sql).await?;
                conn.execute_prepared(&stmt, params).await
            })
            .await;
        self.finish(pooled, result).await
    }

    async fn finish<T>(&self, mut pooled: PooledConnection, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            if e.is_connection_failure()
                || matches!(e, DbError::DeadlineExceeded { .. } | DbError::Cancelled { .. })
            {
                pooled.mark_unhealthy();
            }
        }
        self.pool.release(pooled).await?;
        result
    }

    /// Close scoped connections, drop cached statements and close the pool.
    pub async fn close(&self) {
        self.scopes.close().await;
        self.statements.shutdown();
        self.pool.close().await;
        info!("Database runtime closed");
    }
}

impl std::fmt::Debug for DbRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRuntime")
            .field("pool", &self.pool)
            .field("statements", &self.statements.stats())
            .field("scopes", &self.scopes.count())
            .finish()
    }
}
