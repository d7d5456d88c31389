//! Database-access runtime.
//!
//! Pooled connections, a prepared-statement cache, a typed query-result cache
//! with single-flight loading, and a transaction manager that retries
//! transient failures, fires lifecycle hooks and supports savepoints.
//!
//! ```no_run
//! use db_runtime::{Context, DbRuntime, QueryParam, RuntimeConfig};
//! use db_runtime::db::SqliteConnector;
//! use std::sync::Arc;
//!
//! # async fn demo() -> db_runtime::DbResult<()> {
//! let connector = Arc::new(SqliteConnector::new("sqlite:app.db?mode=rwc")?);
//! let runtime = DbRuntime::open(RuntimeConfig::default(), connector).await?;
//!
//! runtime
//!     .execute_in_transaction(&Context::background(), |ctx| async move {
//!         let tx = ctx.require_transaction()?;
//!         tx.execute("INSERT INTO events (name) VALUES (?)", &[QueryParam::from("boot")])
//!             .await?;
//!         Ok(())
//!     })
//!     .await?;
//! runtime.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, RuntimeConfig};
pub use context::Context;
pub use db::DbRuntime;
pub use error::{DbError, DbResult};
pub use models::{DatabaseType, JsonRow, QueryParam};
