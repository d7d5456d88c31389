//! Reference driver over `sqlx::SqliteConnection`.

use super::driver::{Connection, Connector, PreparedStatement, StatementPreparer, ensure_open};
use super::params::bind_all;
use super::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, JsonRow, QueryParam};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteStatement};
use sqlx::{ConnectOptions, Connection as SqlxConnection, Executor, Statement};
use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Opens SQLite connections from a connection URL.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
}

impl SqliteConnector {
    /// Build a connector from a `sqlite:` URL.
    pub fn new(url: &str) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(url).map_err(|e| {
            DbError::connection(
                format!("Invalid SQLite URL: {}", e),
                "Use sqlite:<path>?mode=rwc or sqlite::memory:",
            )
        })?;
        Ok(Self::from_options(options))
    }

    pub fn from_options(options: SqliteConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let conn = self.options.connect().await?;
        debug!("Opened SQLite connection");
        Ok(Box::new(SqliteDbConnection { conn: Some(conn) }))
    }
}

/// Prepared statement metadata owned independently of any one connection.
#[derive(Debug)]
pub struct SqliteStatementHandle {
    stmt: SqliteStatement<'static>,
    closed: AtomicBool,
}

impl PreparedStatement for SqliteStatementHandle {
    fn sql(&self) -> &str {
        self.stmt.sql()
    }

    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SqliteDbConnection {
    conn: Option<SqliteConnection>,
}

impl SqliteDbConnection {
    fn conn(&mut self) -> DbResult<&mut SqliteConnection> {
        self.conn.as_mut().ok_or_else(|| {
            DbError::connection(
                "SQLite connection is closed",
                "Acquire a new connection from the pool",
            )
        })
    }
}

#[async_trait]
impl StatementPreparer for SqliteDbConnection {
    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn prepare(&mut self, sql: &str) -> DbResult<Arc<dyn PreparedStatement>> {
        let conn = self.conn()?;
        let stmt = conn.prepare(sql).await?;
        Ok(Arc::new(SqliteStatementHandle {
            stmt: Statement::to_owned(&stmt),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Connection for SqliteDbConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let conn = self.conn()?;
        let result = bind_all(sqlx::query(sql), params).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        let conn = self.conn()?;
        let rows = bind_all(sqlx::query(sql), params).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    async fn execute_prepared(
        &mut self,
        stmt: &Arc<dyn PreparedStatement>,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        ensure_open(stmt.as_ref())?;
        let Some(handle) = stmt.as_any().downcast_ref::<SqliteStatementHandle>() else {
            return self.execute(stmt.sql(), params).await;
        };
        let conn = self.conn()?;
        let result = bind_all(handle.stmt.query(), params)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn query_prepared(
        &mut self,
        stmt: &Arc<dyn PreparedStatement>,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        ensure_open(stmt.as_ref())?;
        let Some(handle) = stmt.as_any().downcast_ref::<SqliteStatementHandle>() else {
            return self.query(stmt.sql(), params).await;
        };
        let conn = self.conn()?;
        let rows = bind_all(handle.stmt.query(), params)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    async fn validate(&mut self, query: &str) -> DbResult<()> {
        let conn = self.conn()?;
        conn.ping().await?;
        sqlx::query(query).execute(&mut *conn).await?;
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TxOptions;

    async fn memory() -> Box<dyn Connection> {
        SqliteConnector::new("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let mut conn = memory().await;
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        let n = conn
            .execute(
                "INSERT INTO t (name) VALUES (?), (?)",
                &["a".into(), "b".into()],
            )
            .await
            .unwrap();
        assert_eq!(n, 2);

        let rows = conn
            .query("SELECT id, name FROM t ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], "b");
        assert_eq!(rows[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_prepared_round() {
        let mut conn = memory().await;
        conn.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        let stmt = conn.prepare("INSERT INTO t (v) VALUES (?)").await.unwrap();
        assert_eq!(stmt.kind(), DatabaseType::SQLite);
        for v in 0..3i64 {
            conn.execute_prepared(&stmt, &[v.into()]).await.unwrap();
        }
        let row = conn
            .query_row("SELECT COUNT(*) AS n FROM t", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["n"], 3);

        stmt.close();
        assert!(conn.execute_prepared(&stmt, &[1i64.into()]).await.is_err());
    }

    #[tokio::test]
    async fn test_prepare_failure() {
        let mut conn = memory().await;
        assert!(conn.prepare("SELECT * FROM missing_table").await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_statements() {
        let mut conn = memory().await;
        conn.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        conn.begin(&TxOptions::default()).await.unwrap();
        conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        conn.savepoint("sp1").await.unwrap();
        conn.execute("INSERT INTO t VALUES (2)", &[]).await.unwrap();
        conn.rollback_to_savepoint("sp1").await.unwrap();
        conn.release_savepoint("sp1").await.unwrap();
        conn.commit().await.unwrap();

        let rows = conn.query("SELECT v FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_errors() {
        let mut conn = memory().await;
        conn.close().await.unwrap();
        let err = conn.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert!(conn.validate("SELECT 1").await.is_err());
    }
}
