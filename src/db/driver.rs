//! Connection abstraction consumed by the runtime.
//!
//! The pool, the statement cache and the transaction manager never talk to a
//! database directly. They go through these traits, which a driver implements
//! once per backend. [`crate::db::sqlite`] is the reference implementation.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, JsonRow, QueryParam, TxOptions};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// A live prepared-statement handle.
///
/// Handles are shared (`Arc`) between the statement cache and in-flight
/// executions. `close` marks the handle unusable and releases driver
/// resources; it must be idempotent.
pub trait PreparedStatement: Send + Sync + std::fmt::Debug {
    /// The SQL text this handle was prepared from.
    fn sql(&self) -> &str;

    fn kind(&self) -> DatabaseType;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Downcast hook for drivers that need their concrete handle back.
    fn as_any(&self) -> &dyn Any;
}

/// Anything that can turn SQL text into a [`PreparedStatement`].
#[async_trait]
pub trait StatementPreparer: Send {
    fn kind(&self) -> DatabaseType;

    async fn prepare(&mut self, sql: &str) -> DbResult<Arc<dyn PreparedStatement>>;
}

/// One physical database session.
#[async_trait]
pub trait Connection: StatementPreparer {
    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    /// Run a query and decode every row.
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>>;

    /// Execute through a prepared handle. Drivers without server-side
    /// statements fall back to the handle's SQL text.
    async fn execute_prepared(
        &mut self,
        stmt: &Arc<dyn PreparedStatement>,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        ensure_open(stmt.as_ref())?;
        self.execute(stmt.sql(), params).await
    }

    async fn query_prepared(
        &mut self,
        stmt: &Arc<dyn PreparedStatement>,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        ensure_open(stmt.as_ref())?;
        self.query(stmt.sql(), params).await
    }

    /// Run a query expected to produce at most one row.
    async fn query_row(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<JsonRow>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    async fn begin(&mut self, options: &TxOptions) -> DbResult<()> {
        for stmt in options.begin_statements(self.kind()) {
            self.execute(&stmt, &[]).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.execute(&format!("SAVEPOINT {}", name), &[])
            .await
            .map(|_| ())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
            .await
            .map(|_| ())
    }

    async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.execute(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await
            .map(|_| ())
    }

    /// Lightweight liveness probe used by the pool's health worker.
    async fn validate(&mut self, query: &str) -> DbResult<()> {
        self.query(query, &[]).await.map(|_| ())
    }

    async fn close(&mut self) -> DbResult<()>;
}

/// Factory for new physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> DatabaseType;

    async fn connect(&self) -> DbResult<Box<dyn Connection>>;
}

/// Reject execution through a handle that has been closed.
pub fn ensure_open(stmt: &dyn PreparedStatement) -> DbResult<()> {
    if stmt.is_closed() {
        return Err(DbError::internal(format!(
            "prepared statement is closed: {}",
            stmt.sql()
        )));
    }
    Ok(())
}
