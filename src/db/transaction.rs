//! Retrying transactions with hooks and savepoints.
//!
//! `TransactionManager::execute_in_transaction` runs a unit of work on a
//! transaction-scoped connection:
//!
//! ```text
//! Idle → ConnectionAcquired → Began → Executing → Committing → Committed
//!                               │         │           │
//!                               └─────────┴───────────┴→ RollingBack → RolledBack
//! ```
//!
//! Transient failures are retried with exponential backoff under a fresh
//! transaction id. A call made from inside another transaction's context
//! runs on the same connection inside an automatic savepoint instead.

use super::hooks::{HookContext, HookPhase, TransactionHooks};
use super::lock;
use super::retry::RetryPolicy;
use super::scoped::{ConnectionLock, ScopedConnection, ScopedConnectionManager};
use super::statement_cache::StatementCache;
use super::telemetry::{Observer, SharedObserver, noop};
use crate::config::TransactionConfig;
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, JsonRow, QueryParam, TxOptions, TxOutcome, TxPhase};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Validate a savepoint name: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_savepoint_name(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(DbError::savepoint("Savepoint name cannot be empty", name)),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return Err(DbError::savepoint(
                "Savepoint name must start with a letter or underscore",
                name,
            ));
        }
        Some(_) => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::savepoint(
            "Savepoint name may only contain letters, digits and underscores",
            name,
        ));
    }
    Ok(())
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// The transaction a unit of work runs in.
///
/// Reached from the work's context via [`Context::transaction`] or
/// [`Context::require_transaction`]. Statements go through the shared
/// statement cache on the transaction's own connection.
pub struct ManagedTransaction {
    id: String,
    nest_level: u32,
    attempt: u32,
    scope: Arc<ScopedConnection>,
    statements: Arc<StatementCache>,
    /// Live savepoint names, oldest first. Shared with nested levels.
    savepoints: Arc<Mutex<Vec<String>>>,
    /// Cache-key patterns to invalidate after commit. Shared with nested levels.
    dirty: Arc<Mutex<Vec<String>>>,
    /// Sequence for automatic nested savepoint names.
    nested_seq: Arc<AtomicU32>,
}

impl ManagedTransaction {
    fn new(
        id: &str,
        attempt: u32,
        scope: Arc<ScopedConnection>,
        statements: Arc<StatementCache>,
    ) -> Self {
        Self {
            id: id.to_string(),
            nest_level: 0,
            attempt,
            scope,
            statements,
            savepoints: Arc::new(Mutex::new(Vec::new())),
            dirty: Arc::new(Mutex::new(Vec::new())),
            nested_seq: Arc::new(AtomicU32::new(0)),
        }
    }

    fn nested(&self, nest_level: u32) -> Self {
        Self {
            id: self.id.clone(),
            nest_level,
            attempt: self.attempt,
            scope: Arc::clone(&self.scope),
            statements: Arc::clone(&self.statements),
            savepoints: Arc::clone(&self.savepoints),
            dirty: Arc::clone(&self.dirty),
            nested_seq: Arc::clone(&self.nested_seq),
        }
    }

    /// `sp_nest_<level>_<n>`, unique within the transaction and never equal
    /// to a live savepoint.
    fn next_nested_savepoint(&self, level: u32) -> String {
        let live = lock(&self.savepoints);
        loop {
            let n = self.nested_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let name = format!("sp_nest_{}_{}", level, n);
            if !live.contains(&name) {
                return name;
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 0 for the outermost unit of work.
    pub fn nest_level(&self) -> u32 {
        self.nest_level
    }

    /// 1-based attempt number of the enclosing retry loop.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn kind(&self) -> DatabaseType {
        self.scope.kind()
    }

    pub fn scope(&self) -> &Arc<ScopedConnection> {
        &self.scope
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let mut guard = self.scope.lock().await;
        let result = async {
            let conn = guard.conn()?;
            let stmt = self.statements.get(&mut *conn, sql).await?;
            if stmt.is_closed() {
                // Evicted between lookup and use.
                return conn.execute(sql, params).await;
            }
            conn.execute_prepared(&stmt, params).await
        }
        .await;
        flag_broken(&mut guard, &result);
        result
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        let mut guard = self.scope.lock().await;
        let result = async {
            let conn = guard.conn()?;
            let stmt = self.statements.get(&mut *conn, sql).await?;
            if stmt.is_closed() {
                return conn.query(sql, params).await;
            }
            conn.query_prepared(&stmt, params).await
        }
        .await;
        flag_broken(&mut guard, &result);
        result
    }

    pub async fn query_row(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<JsonRow>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Create a named savepoint. Fails if the name is already live.
    pub async fn create_savepoint(&self, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        let mut guard = self.scope.lock().await;
        if lock(&self.savepoints).iter().any(|n| n == name) {
            return Err(DbError::savepoint("Savepoint already exists", name));
        }
        guard.conn()?.savepoint(name).await?;
        lock(&self.savepoints).push(name.to_string());
        debug!(transaction_id = %self.id, savepoint = name, "Savepoint created");
        Ok(())
    }

    /// Undo everything since `name`. The savepoint stays live; savepoints
    /// created after it are discarded.
    pub async fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        let mut guard = self.scope.lock().await;
        let pos = self.savepoint_position(name)?;
        guard.conn()?.rollback_to_savepoint(name).await?;
        lock(&self.savepoints).truncate(pos + 1);
        debug!(transaction_id = %self.id, savepoint = name, "Rolled back to savepoint");
        Ok(())
    }

    /// Release `name` and every savepoint created after it, keeping their work.
    pub async fn release_savepoint(&self, name: &str) -> DbResult<()> {
        let mut guard = self.scope.lock().await;
        let pos = self.savepoint_position(name)?;
        guard.conn()?.release_savepoint(name).await?;
        lock(&self.savepoints).truncate(pos);
        debug!(transaction_id = %self.id, savepoint = name, "Savepoint released");
        Ok(())
    }

    /// Live savepoint names, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        lock(&self.savepoints).clone()
    }

    fn savepoint_position(&self, name: &str) -> DbResult<usize> {
        lock(&self.savepoints)
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| DbError::savepoint("Savepoint does not exist", name))
    }

    /// Record a cache-key pattern to invalidate once the outermost
    /// transaction commits. Discarded if the enclosing nested scope rolls back.
    pub fn invalidate_on_commit(&self, pattern: impl Into<String>) {
        lock(&self.dirty).push(pattern.into());
    }

    pub fn dirty_patterns(&self) -> Vec<String> {
        lock(&self.dirty).clone()
    }

    async fn begin(&self, options: &TxOptions) -> DbResult<()> {
        let mut guard = self.scope.lock().await;
        let result = match guard.conn() {
            Ok(conn) => conn.begin(options).await,
            Err(e) => Err(e),
        };
        flag_broken(&mut guard, &result);
        result
    }

    async fn commit(&self) -> DbResult<()> {
        let mut guard = self.scope.lock().await;
        let result = match guard.conn() {
            Ok(conn) => conn.commit().await,
            Err(e) => Err(e),
        };
        flag_broken(&mut guard, &result);
        result
    }

    async fn rollback(&self) -> DbResult<()> {
        let mut guard = self.scope.lock().await;
        let result = match guard.conn() {
            Ok(conn) => conn.rollback().await,
            Err(e) => Err(e),
        };
        flag_broken(&mut guard, &result);
        result
    }

    async fn mark_unhealthy(&self) {
        let mut guard = self.scope.lock().await;
        if let Ok(pooled) = guard.pooled() {
            pooled.mark_unhealthy();
        }
    }
}

impl std::fmt::Debug for ManagedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTransaction")
            .field("id", &self.id)
            .field("nest_level", &self.nest_level)
            .field("attempt", &self.attempt)
            .field("savepoints", &self.savepoints())
            .finish()
    }
}

/// Connection failures make the pool close the connection on release.
fn flag_broken<T>(guard: &mut ConnectionLock<'_>, result: &DbResult<T>) {
    if let Err(e) = result {
        if e.is_connection_failure() {
            if let Ok(pooled) = guard.pooled() {
                pooled.mark_unhealthy();
            }
        }
    }
}

/// Releases the scope reference on every exit path. If the owning future is
/// dropped before `release`, the scope is abandoned and poisoned instead.
struct ScopeGuard<'a> {
    scopes: &'a ScopedConnectionManager,
    transaction_id: String,
    armed: bool,
}

impl<'a> ScopeGuard<'a> {
    fn new(scopes: &'a ScopedConnectionManager, transaction_id: &str) -> Self {
        Self {
            scopes,
            transaction_id: transaction_id.to_string(),
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.scopes.release(&self.transaction_id).await {
            warn!(transaction_id = %self.transaction_id, error = %e, "Failed to release transaction scope");
        }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.scopes.abandon(&self.transaction_id);
        }
    }
}

/// Tracks the per-attempt phase and reports each transition.
struct PhaseTracker<'a> {
    transaction_id: &'a str,
    phase: TxPhase,
    observer: &'a dyn Observer,
}

impl<'a> PhaseTracker<'a> {
    fn new(transaction_id: &'a str, observer: &'a dyn Observer) -> Self {
        Self {
            transaction_id,
            phase: TxPhase::Idle,
            observer,
        }
    }

    fn advance(&mut self, next: TxPhase) {
        if !self.phase.can_transition_to(next) {
            warn!(
                transaction_id = self.transaction_id,
                from = %self.phase,
                to = %next,
                "Unexpected transaction phase transition"
            );
        }
        self.phase = next;
        self.observer.transaction_phase(self.transaction_id, next);
    }
}

/// A failed attempt and how it ended.
struct AttemptError {
    error: DbError,
    outcome: TxOutcome,
}

impl AttemptError {
    fn failed(error: DbError) -> Self {
        Self {
            error,
            outcome: TxOutcome::Failed,
        }
    }
}

/// Runs units of work in transactions.
pub struct TransactionManager {
    scopes: Arc<ScopedConnectionManager>,
    statements: Arc<StatementCache>,
    hooks: Arc<TransactionHooks>,
    config: TransactionConfig,
    policy: RetryPolicy,
    observer: SharedObserver,
}

impl TransactionManager {
    pub fn new(
        scopes: Arc<ScopedConnectionManager>,
        statements: Arc<StatementCache>,
        hooks: Arc<TransactionHooks>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            scopes,
            statements,
            hooks,
            policy: RetryPolicy::new(config.retry.clone()),
            config,
            observer: noop(),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn hooks(&self) -> &Arc<TransactionHooks> {
        &self.hooks
    }

    pub fn scopes(&self) -> &Arc<ScopedConnectionManager> {
        &self.scopes
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Run `work` in a transaction with the configured default options.
    ///
    /// `work` receives a context carrying the [`ManagedTransaction`]. It may
    /// be called more than once: transient failures are retried up to
    /// `max_retries` times. When retries were attempted, the final error is
    /// wrapped in `RetriesExhausted`; a first-attempt failure is returned
    /// as-is.
    pub async fn execute_in_transaction<T, F, Fut>(&self, ctx: &Context, work: F) -> DbResult<T>
    where
        F: FnMut(Context) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        let options = self.config.options.clone();
        self.execute_in_transaction_with(ctx, &options, work).await
    }

    /// Like [`execute_in_transaction`](Self::execute_in_transaction) with
    /// explicit isolation options. Options are ignored for nested calls.
    pub async fn execute_in_transaction_with<T, F, Fut>(
        &self,
        ctx: &Context,
        options: &TxOptions,
        mut work: F,
    ) -> DbResult<T>
    where
        F: FnMut(Context) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        if let Some(parent) = ctx.transaction() {
            let parent = Arc::clone(parent);
            return self.run_nested(ctx, &parent, work).await;
        }

        let ctx = if ctx.deadline().is_some() {
            ctx.clone()
        } else {
            ctx.with_timeout(self.config.default_timeout)
        };
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let transaction_id = generate_transaction_id();
            let result = self
                .run_attempt(&ctx, &transaction_id, attempt, options, &mut work)
                .await;

            let failure = match result {
                Ok(value) => {
                    self.observer.transaction_finished(
                        &transaction_id,
                        TxOutcome::Committed,
                        attempt,
                        started.elapsed(),
                    );
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if self.policy.should_retry(&failure.error, attempt) {
                let delay = self.policy.backoff(attempt);
                info!(
                    transaction_id = %transaction_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.error,
                    "Transient transaction failure, retrying"
                );
                if let Err(e) = ctx.sleep(delay).await {
                    self.observer.transaction_finished(
                        &transaction_id,
                        failure.outcome,
                        attempt,
                        started.elapsed(),
                    );
                    return Err(e);
                }
                continue;
            }

            self.observer.transaction_finished(
                &transaction_id,
                failure.outcome,
                attempt,
                started.elapsed(),
            );
            if attempt > 1 {
                warn!(transaction_id = %transaction_id, attempts = attempt, error = %failure.error, "Transaction failed after retries");
                return Err(DbError::retries_exhausted(attempt, failure.error));
            }
            return Err(failure.error);
        }
    }

    async fn run_attempt<T, F, Fut>(
        &self,
        ctx: &Context,
        transaction_id: &str,
        attempt: u32,
        options: &TxOptions,
        work: &mut F,
    ) -> Result<T, AttemptError>
    where
        F: FnMut(Context) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        let mut phase = PhaseTracker::new(transaction_id, self.observer.as_ref());

        let scope = self
            .scopes
            .acquire(ctx, transaction_id, 0)
            .await
            .map_err(AttemptError::failed)?;
        let guard = ScopeGuard::new(&self.scopes, transaction_id);
        phase.advance(TxPhase::ConnectionAcquired);

        let tx = Arc::new(ManagedTransaction::new(
            transaction_id,
            attempt,
            scope,
            Arc::clone(&self.statements),
        ));

        if let Err(e) = tx.begin(options).await {
            debug!(transaction_id, error = %e, "Begin failed");
            guard.release().await;
            return Err(AttemptError::failed(e));
        }
        phase.advance(TxPhase::Began);
        debug!(transaction_id, attempt, "Transaction started");

        let body = match self.hooks.run(&self.hook_ctx(&tx, HookPhase::BeforeBegin, None)).await {
            Ok(()) => {
                phase.advance(TxPhase::Executing);
                ctx.run("transaction", work(ctx.with_transaction(Arc::clone(&tx))))
                    .await
            }
            Err(e) => Err(e),
        };

        let result = match body {
            Ok(value) => self.commit(&tx, &mut phase, value).await,
            Err(e) => Err(self.rollback(&tx, &mut phase, e).await),
        };
        guard.release().await;
        result
    }

    async fn commit<T>(
        &self,
        tx: &ManagedTransaction,
        phase: &mut PhaseTracker<'_>,
        value: T,
    ) -> Result<T, AttemptError> {
        phase.advance(TxPhase::Committing);

        if let Err(e) = self
            .hooks
            .run(&self.hook_ctx(tx, HookPhase::BeforeCommit, None))
            .await
        {
            return Err(self.rollback(tx, phase, e).await);
        }

        if let Err(e) = tx.commit().await {
            warn!(transaction_id = %tx.id, error = %e, "Commit failed");
            return Err(self.rollback(tx, phase, e).await);
        }
        phase.advance(TxPhase::Committed);
        debug!(transaction_id = %tx.id, "Transaction committed");

        self.hooks
            .run(&self.hook_ctx(tx, HookPhase::AfterCommit, None))
            .await
            .ok();
        Ok(value)
    }

    async fn rollback(
        &self,
        tx: &ManagedTransaction,
        phase: &mut PhaseTracker<'_>,
        error: DbError,
    ) -> AttemptError {
        phase.advance(TxPhase::RollingBack);
        let cause = Some(error.to_string());

        if let Err(hook_err) = self
            .hooks
            .run(&self.hook_ctx(tx, HookPhase::BeforeRollback, cause.clone()))
            .await
        {
            warn!(transaction_id = %tx.id, error = %hook_err, "before_rollback hook failed");
        }

        let (error, outcome) = match tx.rollback().await {
            Ok(()) => (error, TxOutcome::RolledBack),
            Err(rollback_err) => {
                warn!(transaction_id = %tx.id, error = %rollback_err, "Rollback failed");
                tx.mark_unhealthy().await;
                (DbError::rollback_failed(error, rollback_err), TxOutcome::Failed)
            }
        };
        if error.is_connection_failure() || matches!(error, DbError::DeadlineExceeded { .. } | DbError::Cancelled { .. }) {
            // The session state is unknown after an interrupted statement.
            tx.mark_unhealthy().await;
        }
        phase.advance(TxPhase::RolledBack);
        debug!(transaction_id = %tx.id, error = %error, "Transaction rolled back");

        self.hooks
            .run(&self.hook_ctx(tx, HookPhase::AfterRollback, cause))
            .await
            .ok();
        AttemptError { error, outcome }
    }

    /// Run `work` inside an automatic savepoint on the parent's connection.
    async fn run_nested<T, F, Fut>(
        &self,
        ctx: &Context,
        parent: &ManagedTransaction,
        mut work: F,
    ) -> DbResult<T>
    where
        F: FnMut(Context) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        let level = parent.nest_level() + 1;
        self.scopes.acquire(ctx, parent.id(), level).await?;
        let guard = ScopeGuard::new(&self.scopes, parent.id());

        let tx = Arc::new(parent.nested(level));
        let savepoint = parent.next_nested_savepoint(level);
        let dirty_mark = lock(&tx.dirty).len();

        let result = async {
            tx.create_savepoint(&savepoint).await?;
            debug!(transaction_id = %tx.id, nest_level = level, "Nested transaction started");

            match ctx
                .run("nested transaction", work(ctx.with_transaction(Arc::clone(&tx))))
                .await
            {
                Ok(value) => {
                    tx.release_savepoint(&savepoint).await?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback_to_savepoint(&savepoint).await {
                        return Err(DbError::rollback_failed(e, rollback_err));
                    }
                    if let Err(release_err) = tx.release_savepoint(&savepoint).await {
                        warn!(transaction_id = %tx.id, error = %release_err, "Failed to release rolled-back savepoint");
                    }
                    lock(&tx.dirty).truncate(dirty_mark);
                    debug!(transaction_id = %tx.id, nest_level = level, error = %e, "Nested transaction rolled back");
                    Err(e)
                }
            }
        }
        .await;

        guard.release().await;
        result
    }

    fn hook_ctx(&self, tx: &ManagedTransaction, phase: HookPhase, error: Option<String>) -> HookContext {
        HookContext {
            transaction_id: tx.id.clone(),
            nest_level: tx.nest_level,
            attempt: tx.attempt,
            phase,
            dirty_patterns: tx.dirty_patterns(),
            error,
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_name_validation() {
        assert!(validate_savepoint_name("sp_1").is_ok());
        assert!(validate_savepoint_name("_inner").is_ok());
        assert!(validate_savepoint_name("Before_Update2").is_ok());

        assert!(validate_savepoint_name("").is_err());
        assert!(validate_savepoint_name("1sp").is_err());
        assert!(validate_savepoint_name("sp-1").is_err());
        assert!(validate_savepoint_name("sp; DROP TABLE users").is_err());
        assert!(validate_savepoint_name("naïve").is_err());
    }

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32);
        assert_ne!(id, generate_transaction_id());
    }
}
