//! Transaction lifecycle hooks.
//!
//! Hooks are async callbacks keyed by phase. A `before_*` hook that fails
//! aborts the transition (a failing `before_commit` turns the commit into a
//! rollback). `after_*` hooks are observers: each runs in its own unwind
//! boundary and its failures are logged, never returned.

use super::{lock_read, lock_write};
use crate::error::{DbError, DbResult};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    BeforeBegin,
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeBegin => "before_begin",
            Self::BeforeCommit => "before_commit",
            Self::AfterCommit => "after_commit",
            Self::BeforeRollback => "before_rollback",
            Self::AfterRollback => "after_rollback",
        }
    }

    /// Whether a failure in this phase may abort the transaction.
    pub fn can_abort(&self) -> bool {
        matches!(
            self,
            Self::BeforeBegin | Self::BeforeCommit | Self::BeforeRollback
        )
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook is told about the transaction.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub transaction_id: String,
    pub nest_level: u32,
    /// 1-based attempt number within the retry loop.
    pub attempt: u32,
    pub phase: HookPhase,
    /// Cache-key patterns recorded with `invalidate_on_commit`.
    pub dirty_patterns: Vec<String>,
    /// Display form of the error that triggered a rollback.
    pub error: Option<String>,
}

pub type HookFn = Arc<dyn Fn(HookContext) -> BoxFuture<'static, DbResult<()>> + Send + Sync>;

/// Ordered hook lists per phase.
#[derive(Default)]
pub struct TransactionHooks {
    hooks: RwLock<HashMap<HookPhase, Vec<HookFn>>>,
}

impl TransactionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for `phase`. Hooks run in registration order.
    pub fn add_hook<F, Fut>(&self, phase: HookPhase, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        let hook: HookFn = Arc::new(move |ctx| hook(ctx).boxed());
        lock_write(&self.hooks)
            .entry(phase)
            .or_default()
            .push(hook);
    }

    pub fn add_before_begin_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        self.add_hook(HookPhase::BeforeBegin, hook);
    }

    pub fn add_before_commit_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        self.add_hook(HookPhase::BeforeCommit, hook);
    }

    pub fn add_after_commit_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        self.add_hook(HookPhase::AfterCommit, hook);
    }

    pub fn add_before_rollback_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        self.add_hook(HookPhase::BeforeRollback, hook);
    }

    pub fn add_after_rollback_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        self.add_hook(HookPhase::AfterRollback, hook);
    }

    pub fn count(&self, phase: HookPhase) -> usize {
        lock_read(&self.hooks).get(&phase).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        lock_write(&self.hooks).clear();
    }

    /// Run every hook for `ctx.phase`.
    ///
    /// For abortable phases the first failure (error or panic) stops the run
    /// and is returned as a `Hook` error. For `after_*` phases every hook runs
    /// and failures are only logged.
    pub async fn run(&self, ctx: &HookContext) -> DbResult<()> {
        let hooks: Vec<HookFn> = lock_read(&self.hooks)
            .get(&ctx.phase)
            .cloned()
            .unwrap_or_default();
        if hooks.is_empty() {
            return Ok(());
        }
        debug!(
            transaction_id = %ctx.transaction_id,
            phase = %ctx.phase,
            count = hooks.len(),
            "Running transaction hooks"
        );

        for hook in &hooks {
            let failure = match invoke(hook, ctx.clone()).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => match e {
                    DbError::Hook { .. } => e,
                    other => DbError::hook(ctx.phase.as_str(), other.to_string()),
                },
                Err(panic) => DbError::hook(ctx.phase.as_str(), format!("hook panicked: {}", panic)),
            };

            if ctx.phase.can_abort() {
                return Err(failure);
            }
            warn!(
                transaction_id = %ctx.transaction_id,
                phase = %ctx.phase,
                error = %failure,
                "Transaction hook failed; continuing"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = lock_read(&self.hooks);
        let counts: HashMap<&str, usize> = hooks
            .iter()
            .map(|(phase, list)| (phase.as_str(), list.len()))
            .collect();
        f.debug_struct("TransactionHooks")
            .field("hooks", &counts)
            .finish()
    }
}

/// Call a hook inside an unwind boundary. `Err` carries the panic message.
async fn invoke(hook: &HookFn, ctx: HookContext) -> Result<DbResult<()>, String> {
    let fut = std::panic::catch_unwind(AssertUnwindSafe(|| hook(ctx))).map_err(panic_message)?;
    AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ctx(phase: HookPhase) -> HookContext {
        HookContext {
            transaction_id: "tx_test".to_string(),
            nest_level: 0,
            attempt: 1,
            phase,
            dirty_patterns: Vec::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let hooks = TransactionHooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            hooks.add_before_commit_hook(move |_| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(i);
                    Ok(())
                }
            });
        }
        hooks.run(&ctx(HookPhase::BeforeCommit)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(hooks.count(HookPhase::BeforeCommit), 3);
        assert_eq!(hooks.count(HookPhase::AfterCommit), 0);
    }

    #[tokio::test]
    async fn test_before_hook_failure_stops_run() {
        let hooks = TransactionHooks::new();
        let ran_second = Arc::new(Mutex::new(false));
        hooks.add_before_begin_hook(|_| async { Err(DbError::invalid_input("not today")) });
        let flag = Arc::clone(&ran_second);
        hooks.add_before_begin_hook(move |_| {
            let flag = Arc::clone(&flag);
            async move {
                *flag.lock().unwrap() = true;
                Ok(())
            }
        });

        let err = hooks.run(&ctx(HookPhase::BeforeBegin)).await.unwrap_err();
        assert!(matches!(err, DbError::Hook { ref phase, .. } if phase == "before_begin"));
        assert!(err.to_string().contains("not today"));
        assert!(!*ran_second.lock().unwrap());
    }

    #[tokio::test]
    async fn test_after_hook_panic_is_isolated() {
        let hooks = TransactionHooks::new();
        let ran = Arc::new(Mutex::new(0));
        hooks.add_after_commit_hook(|_| async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        hooks.add_after_commit_hook(|_| async { Err(DbError::internal("ignored")) });
        let counter = Arc::clone(&ran);
        hooks.add_after_commit_hook(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        });

        hooks.run(&ctx(HookPhase::AfterCommit)).await.unwrap();
        assert_eq!(*ran.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_before_hook_panic_becomes_error() {
        let hooks = TransactionHooks::new();
        hooks.add_before_commit_hook(|_| async {
            if true {
                panic!("bad hook");
            }
            Ok(())
        });
        let err = hooks.run(&ctx(HookPhase::BeforeCommit)).await.unwrap_err();
        assert!(err.to_string().contains("bad hook"));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(HookPhase::AfterRollback.to_string(), "after_rollback");
        assert!(HookPhase::BeforeRollback.can_abort());
        assert!(!HookPhase::AfterCommit.can_abort());
    }
}
