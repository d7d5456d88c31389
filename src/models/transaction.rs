//! Transaction-related data models.

use super::DatabaseType;
use serde::{Deserialize, Serialize};

/// Isolation level requested when a transaction begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Whatever the server is configured with.
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
        }
    }
}

/// Options for a native `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxOptions {
    #[serde(default)]
    pub isolation: IsolationLevel,
    #[serde(default)]
    pub read_only: bool,
}

impl TxOptions {
    pub fn serializable() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            read_only: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            isolation: IsolationLevel::Default,
            read_only: true,
        }
    }

    /// Statements that open a transaction with these options, in order.
    ///
    /// SQLite has no isolation levels; a serializable request takes the write
    /// lock up front with `BEGIN IMMEDIATE`. MySQL sets the level for the next
    /// transaction before starting it.
    pub fn begin_statements(&self, kind: DatabaseType) -> Vec<String> {
        match kind {
            DatabaseType::SQLite => match self.isolation {
                IsolationLevel::Serializable => vec!["BEGIN IMMEDIATE".to_string()],
                _ => vec!["BEGIN".to_string()],
            },
            DatabaseType::PostgreSQL => {
                let mut sql = "BEGIN".to_string();
                if let Some(level) = self.isolation.as_sql() {
                    sql.push_str(" ISOLATION LEVEL ");
                    sql.push_str(level);
                }
                if self.read_only {
                    sql.push_str(" READ ONLY");
                }
                vec![sql]
            }
            DatabaseType::MySQL => {
                let mut stmts = Vec::with_capacity(2);
                if let Some(level) = self.isolation.as_sql() {
                    stmts.push(format!("SET TRANSACTION ISOLATION LEVEL {}", level));
                }
                stmts.push(if self.read_only {
                    "START TRANSACTION READ ONLY".to_string()
                } else {
                    "START TRANSACTION".to_string()
                });
                stmts
            }
        }
    }
}

/// Per-attempt transaction state machine.
///
/// `Idle → ConnectionAcquired → Began → Executing → (Committing → Committed | RollingBack → RolledBack)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPhase {
    Idle,
    ConnectionAcquired,
    Began,
    Executing,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TxPhase {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TxPhase) -> bool {
        use TxPhase::*;
        matches!(
            (self, next),
            (Idle, ConnectionAcquired)
                | (ConnectionAcquired, Began)
                | (Began, Executing)
                | (Began, RollingBack)
                | (Executing, Committing)
                | (Executing, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    /// Check if the attempt has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ConnectionAcquired => "connection_acquired",
            Self::Began => "began",
            Self::Executing => "executing",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for TxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of `execute_in_transaction`, reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxOutcome {
    Committed,
    RolledBack,
    Failed,
}

/// Metadata about a transaction-scoped connection, for listing.
#[derive(Debug, Clone, Serialize)]
pub struct ScopedConnectionInfo {
    pub transaction_id: String,
    pub nest_level: u32,
    pub ref_count: usize,
    pub exclusive: bool,
    pub poisoned: bool,
    pub kind: DatabaseType,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub idle_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_begin_statements() {
        assert_eq!(
            TxOptions::default().begin_statements(DatabaseType::SQLite),
            vec!["BEGIN"]
        );
        assert_eq!(
            TxOptions::serializable().begin_statements(DatabaseType::SQLite),
            vec!["BEGIN IMMEDIATE"]
        );
    }

    #[test]
    fn test_postgres_begin_statements() {
        let opts = TxOptions {
            isolation: IsolationLevel::RepeatableRead,
            read_only: true,
        };
        assert_eq!(
            opts.begin_statements(DatabaseType::PostgreSQL),
            vec!["BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY"]
        );
    }

    #[test]
    fn test_mysql_begin_statements() {
        assert_eq!(
            TxOptions::serializable().begin_statements(DatabaseType::MySQL),
            vec![
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
                "START TRANSACTION"
            ]
        );
    }

    #[test]
    fn test_phase_transitions() {
        assert!(TxPhase::Idle.can_transition_to(TxPhase::ConnectionAcquired));
        assert!(TxPhase::Committing.can_transition_to(TxPhase::RollingBack));
        assert!(!TxPhase::Committed.can_transition_to(TxPhase::RollingBack));
        assert!(!TxPhase::Idle.can_transition_to(TxPhase::Executing));
        assert!(TxPhase::RolledBack.is_terminal());
    }
}
