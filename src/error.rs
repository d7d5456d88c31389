//! Error types for the database runtime.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Errors fall into four families: timeout/cancellation, transient (retryable),
//! permanent, and hook failures. [`DbError::is_transient`] drives the transaction
//! retry loop.

use thiserror::Error;

/// SQLSTATE / driver codes that identify a retryable failure.
///
/// - `40001` serialization failure (PostgreSQL, SQL standard)
/// - `40P01` deadlock detected (PostgreSQL)
/// - `1205` lock wait timeout, `1213` deadlock (MySQL)
/// - `5` SQLITE_BUSY, `6` SQLITE_LOCKED, `517` SQLITE_BUSY_SNAPSHOT
const TRANSIENT_CODES: &[&str] = &["40001", "40P01", "1205", "1213", "5", "6", "517"];

/// Message fragments that mark a failure as transient when the driver
/// supplies no structured code.
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "broken pipe",
    "timeout",
    "timed out",
    "deadlock",
    "serialization failure",
    "could not serialize",
    "database is locked",
];

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "40001" for serialization failure
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Deadline exceeded during {operation}")]
    DeadlineExceeded { operation: String },

    #[error("Cancelled during {operation}")]
    Cancelled { operation: String },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Too many transaction-scoped connections (limit: {limit})")]
    ScopeLimit { limit: usize },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Savepoint error: {message} (savepoint: {name})")]
    Savepoint { message: String, name: String },

    #[error("Hook failed in {phase}: {message}")]
    Hook { phase: String, message: String },

    #[error("Transaction failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("{source} (rollback also failed: {rollback})")]
    RollbackFailed {
        #[source]
        source: Box<DbError>,
        rollback: Box<DbError>,
    },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a savepoint error.
    pub fn savepoint(message: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Savepoint {
            message: message.into(),
            name: name.into(),
        }
    }

    /// Create a hook failure for the given lifecycle phase.
    pub fn hook(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Wrap the last attempt's error with the number of attempts made.
    pub fn retries_exhausted(attempts: u32, source: DbError) -> Self {
        Self::RetriesExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Augment a unit-of-work error with a failed rollback.
    pub fn rollback_failed(source: DbError, rollback: DbError) -> Self {
        Self::RollbackFailed {
            source: Box::new(source),
            rollback: Box::new(rollback),
        }
    }

    /// Create a cache backend error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::RetriesExhausted { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// The driver-supplied SQLSTATE or native error code, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            Self::RollbackFailed { source, .. } => source.sql_state(),
            _ => None,
        }
    }

    /// Check if this error is likely to succeed when the transaction is retried.
    ///
    /// Structured driver codes are consulted first; message matching against
    /// known transient causes is only a fallback.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cancelled { .. }
            | Self::DeadlineExceeded { .. }
            | Self::PoolClosed
            | Self::ScopeLimit { .. }
            | Self::Hook { .. }
            | Self::Savepoint { .. }
            | Self::InvalidInput { .. } => false,
            Self::Timeout { .. } => true,
            Self::RetriesExhausted { .. } => false,
            Self::RollbackFailed { source, .. } => source.is_transient(),
            Self::Database {
                sql_state: Some(code),
                ..
            } if TRANSIENT_CODES.contains(&code.as_str()) => true,
            other => message_is_transient(&other.to_string()),
        }
    }

    /// Check if this error means the underlying connection can no longer be trusted.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::RollbackFailed { rollback, .. } => rollback.is_connection_failure(),
            _ => false,
        }
    }
}

/// Substring fallback for drivers that do not report structured codes.
pub fn message_is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("driver pool acquire", 0),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "The connection will be discarded; retry the operation",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_structured_codes_are_transient() {
        let err = DbError::database("could not commit", Some("40001".to_string()), "retry");
        assert!(err.is_transient());
        let err = DbError::database("busy", Some("5".to_string()), "retry");
        assert!(err.is_transient());
    }

    #[test]
    fn test_permanent_database_error() {
        let err = DbError::database(
            "UNIQUE constraint failed: users.email",
            Some("2067".to_string()),
            "check data",
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_message_fallback_classification() {
        assert!(DbError::connection("connection reset by peer", "").is_transient());
        assert!(DbError::internal("Deadlock found when trying to get lock").is_transient());
        assert!(DbError::database("database is locked", None, "").is_transient());
        assert!(!DbError::internal("syntax error near SELEC").is_transient());
    }

    #[test]
    fn test_context_errors_never_transient() {
        assert!(!DbError::cancelled("acquire").is_transient());
        assert!(!DbError::deadline_exceeded("timeout waiting").is_transient());
        assert!(!DbError::hook("before_commit", "timed out").is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(DbError::timeout("connection acquire", 30_000).is_transient());
    }

    #[test]
    fn test_retries_exhausted_names_attempts_and_cause() {
        let err = DbError::retries_exhausted(4, DbError::database("deadlock", None, ""));
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("deadlock"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_rollback_failed_keeps_original_error() {
        let err = DbError::rollback_failed(
            DbError::invalid_input("bad row"),
            DbError::connection("broken pipe", "reconnect"),
        );
        assert!(err.to_string().contains("bad row"));
        assert!(err.to_string().contains("rollback also failed"));
        assert!(err.is_connection_failure());
    }
}
