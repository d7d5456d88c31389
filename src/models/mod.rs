//! Data models for the database runtime.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod stats;
pub mod transaction;

// Re-export commonly used types
pub use connection::{ConnectionInfo, DatabaseType};
pub use query::{JsonRow, QueryParam, row_i64};
pub use stats::{CacheStats, PoolStats, StatementCacheStats, hit_rate};
pub use transaction::{
    IsolationLevel, ScopedConnectionInfo, TxOptions, TxOutcome, TxPhase,
};
