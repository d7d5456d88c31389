//! Configuration for the database runtime.
//!
//! Component configuration is a set of plain value structs with documented
//! defaults. The binary layers a clap CLI (with environment fallbacks) and
//! connection-URL query parameters on top of them.

use crate::error::{DbError, DbResult};
use crate::models::TxOptions;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 1800;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_VALIDATION_QUERY: &str = "SELECT 1";

// Statement cache defaults
pub const DEFAULT_STATEMENT_CACHE_SIZE: usize = 256;
pub const DEFAULT_STATEMENT_TTL_SECS: u64 = 600;
pub const DEFAULT_STATEMENT_SWEEP_INTERVAL_SECS: u64 = 60;

// Query cache defaults
pub const DEFAULT_QUERY_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_QUERY_CACHE_TTL_SECS: u64 = 300;

// Retry defaults
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 50;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 2000;

// Transaction-scoped connection defaults
pub const DEFAULT_MAX_SCOPED_CONNECTIONS: usize = 100;
pub const DEFAULT_SCOPE_IDLE_SECS: u64 = 300;
pub const DEFAULT_SCOPE_SWEEP_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Component configuration
// =============================================================================

/// Connection pool configuration. Immutable once the pool is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub max_lifetime: Duration,
    pub max_idle_time: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub validation_query: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS as usize,
            max_connections: DEFAULT_MAX_CONNECTIONS as usize,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            max_lifetime: Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS),
            max_idle_time: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            health_check_timeout: Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
            validation_query: DEFAULT_VALIDATION_QUERY.to_string(),
        }
    }
}

impl PoolConfig {
    /// Build a pool configuration from URL-supplied options.
    pub fn from_options(opts: &PoolOptions, is_sqlite: bool) -> Self {
        Self {
            min_connections: opts.min_connections_or_default() as usize,
            max_connections: opts.max_connections_or_default(is_sqlite) as usize,
            acquire_timeout: Duration::from_secs(opts.acquire_timeout_or_default()),
            max_lifetime: Duration::from_secs(opts.max_lifetime_or_default()),
            max_idle_time: Duration::from_secs(opts.idle_timeout_or_default()),
            health_check_interval: Duration::from_secs(opts.health_check_interval_or_default()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_connections == 0 {
            return Err(DbError::invalid_input(
                "max_connections must be greater than 0",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DbError::invalid_input(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(DbError::invalid_input(
                "health_check_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Prepared-statement cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementCacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: DEFAULT_STATEMENT_CACHE_SIZE,
            ttl: Duration::from_secs(DEFAULT_STATEMENT_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_STATEMENT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl StatementCacheConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.max_size == 0 {
            return Err(DbError::invalid_input(
                "statement cache max_size must be greater than 0",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(DbError::invalid_input(
                "statement cache sweep_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Query result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_QUERY_CACHE_CAPACITY,
            ttl: Duration::from_secs(DEFAULT_QUERY_CACHE_TTL_SECS),
        }
    }
}

/// Transaction retry policy bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Transaction-scoped connection registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub max_scoped_connections: usize,
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            max_scoped_connections: DEFAULT_MAX_SCOPED_CONNECTIONS,
            idle_threshold: Duration::from_secs(DEFAULT_SCOPE_IDLE_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SCOPE_SWEEP_INTERVAL_SECS),
        }
    }
}

impl ScopeConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.max_scoped_connections == 0 {
            return Err(DbError::invalid_input(
                "max_scoped_connections must be greater than 0",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(DbError::invalid_input(
                "scope sweep_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Transaction manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Deadline injected when the caller's context carries none.
    pub default_timeout: Duration,
    pub options: TxOptions,
    pub retry: RetryConfig,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            options: TxOptions::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Everything a [`DbRuntime`](crate::db::DbRuntime) needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub statements: StatementCacheConfig,
    pub query_cache: QueryCacheConfig,
    pub scope: ScopeConfig,
    pub transaction: TransactionConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> DbResult<()> {
        self.pool.validate()?;
        self.statements.validate()?;
        self.scope.validate()?;
        Ok(())
    }
}

// =============================================================================
// Connection URL options
// =============================================================================

/// Connection pool configuration options parsed from database URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10, 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Maximum connection age in seconds (default: 1800)
    pub max_lifetime_secs: Option<u64>,
    /// Health check interval in seconds (default: 30)
    pub health_check_interval_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    pub fn max_lifetime_or_default(&self) -> u64 {
        self.max_lifetime_secs.unwrap_or(DEFAULT_MAX_LIFETIME_SECS)
    }

    pub fn health_check_interval_or_default(&self) -> u64 {
        self.health_check_interval_secs
            .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        if self.health_check_interval_secs == Some(0) {
            return Err("health_check_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Database connection configuration parsed from CLI arguments.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection identifier. From "id=url" format, or derived from database name, or "default".
    pub id: String,
    /// Full connection URL (sensitive - not logged).
    pub connection_string: String,
    /// Database name extracted from URL path.
    pub database: Option<String>,
    /// Connection pool configuration options parsed from URL query parameters.
    pub pool_options: PoolOptions,
}

impl DatabaseConfig {
    /// Pool option keys that we extract from URL query parameters.
    const POOL_OPTION_KEYS: &'static [&'static str] = &[
        "max_connections",
        "min_connections",
        "idle_timeout",
        "acquire_timeout",
        "max_lifetime",
        "health_check_interval",
    ];

    /// Parse a database config from CLI argument.
    ///
    /// # Format
    ///
    /// - `connection_string` - Uses database name as ID
    /// - `id=connection_string` - Named connection
    ///
    /// Pool options ride along as query parameters and are stripped before the
    /// URL reaches the driver:
    ///
    /// ```text
    /// sqlite:/tmp/app.db?mode=rwc&max_connections=4
    /// orders=sqlite:/var/lib/orders.db?max_lifetime=900
    /// ```
    pub fn parse(s: &str) -> Result<Self, String> {
        // Split name=url format (only if '=' before the scheme separator)
        let scheme_pos = s.find(':').unwrap_or(s.len());
        let (explicit_name, url_str) = match s[..scheme_pos].find('=') {
            Some(idx) => (Some(s[..idx].trim()), &s[idx + 1..]),
            None => (None, s),
        };

        if let Some(name) = explicit_name {
            if name.is_empty() {
                return Err("Connection ID cannot be empty".to_string());
            }
            if name.eq_ignore_ascii_case("default") {
                return Err(
                    "Connection ID 'default' is reserved and cannot be used explicitly."
                        .to_string(),
                );
            }
        }

        let mut url = Url::parse(url_str).map_err(|e| format!("Invalid URL: {e}"))?;
        let mut opts = Self::extract_options(&mut url, Self::POOL_OPTION_KEYS);
        let pool_options = Self::parse_pool_options(&mut opts);
        pool_options.validate()?;

        let database = Self::db_name(&url);
        let scheme = url.scheme().to_lowercase();
        if database.is_none() && scheme.starts_with("sqlite") {
            return Err("SQLite requires a database file path".to_string());
        }

        // ID priority: explicit name > database name > "default"
        let id = explicit_name
            .map(String::from)
            .or_else(|| database.clone())
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            id,
            connection_string: url.to_string(),
            database,
            pool_options,
        })
    }

    /// Parse pool options from extracted URL query parameters.
    fn parse_pool_options(opts: &mut HashMap<String, String>) -> PoolOptions {
        PoolOptions {
            max_connections: opts.remove("max_connections").and_then(|v| v.parse().ok()),
            min_connections: opts.remove("min_connections").and_then(|v| v.parse().ok()),
            idle_timeout_secs: opts.remove("idle_timeout").and_then(|v| v.parse().ok()),
            acquire_timeout_secs: opts.remove("acquire_timeout").and_then(|v| v.parse().ok()),
            max_lifetime_secs: opts.remove("max_lifetime").and_then(|v| v.parse().ok()),
            health_check_interval_secs: opts
                .remove("health_check_interval")
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Extract runtime options from URL query params, keeping others for the driver.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }

    fn db_name(url: &Url) -> Option<String> {
        url.path()
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches(".sqlite").trim_end_matches(".db"))
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    pub fn is_sqlite(&self) -> bool {
        self.connection_string.to_lowercase().starts_with("sqlite")
    }
}

// =============================================================================
// CLI
// =============================================================================

/// Command line for the workload driver binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-runtime",
    about = "Run a concurrent transactional workload through the database runtime",
    version
)]
pub struct Config {
    /// Database connection URL, optionally "id=url".
    /// Pool options may be given as query parameters.
    #[arg(
        short = 'd',
        long = "database",
        value_name = "URL",
        env = "DBRT_DATABASE",
        default_value = "sqlite:db-runtime-demo.db?mode=rwc"
    )]
    pub database: String,

    /// Concurrent workers
    #[arg(short, long, default_value_t = 4, env = "DBRT_WORKERS")]
    pub workers: usize,

    /// Transactions per worker
    #[arg(short, long, default_value_t = 25, env = "DBRT_ITERATIONS")]
    pub iterations: usize,

    /// Retries after the first attempt for transient failures
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, env = "DBRT_MAX_RETRIES")]
    pub max_retries: u32,

    /// Transaction timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_TRANSACTION_TIMEOUT_SECS,
        env = "DBRT_TRANSACTION_TIMEOUT"
    )]
    pub transaction_timeout: u64,

    /// Prepared statement cache size
    #[arg(
        long,
        default_value_t = DEFAULT_STATEMENT_CACHE_SIZE,
        env = "DBRT_STATEMENT_CACHE_SIZE"
    )]
    pub statement_cache_size: usize,

    /// Query result cache TTL in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_QUERY_CACHE_TTL_SECS,
        env = "DBRT_QUERY_CACHE_TTL"
    )]
    pub query_cache_ttl: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBRT_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBRT_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parse the database argument.
    pub fn parse_database(&self) -> Result<DatabaseConfig, String> {
        DatabaseConfig::parse(&self.database)
    }

    /// Assemble the runtime configuration for a parsed database.
    pub fn runtime_config(&self, db: &DatabaseConfig) -> RuntimeConfig {
        RuntimeConfig {
            pool: PoolConfig::from_options(&db.pool_options, db.is_sqlite()),
            statements: StatementCacheConfig {
                max_size: self.statement_cache_size,
                ..StatementCacheConfig::default()
            },
            query_cache: QueryCacheConfig {
                ttl: Duration::from_secs(self.query_cache_ttl),
                ..QueryCacheConfig::default()
            },
            scope: ScopeConfig::default(),
            transaction: TransactionConfig {
                default_timeout: Duration::from_secs(self.transaction_timeout),
                options: TxOptions::default(),
                retry: RetryConfig {
                    max_retries: self.max_retries,
                    ..RetryConfig::default()
                },
            },
        }
    }
}
