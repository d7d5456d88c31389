//! Request context: cancellation, deadlines and the ambient transaction.
//!
//! Every blocking operation in the runtime takes a `&Context`. Cancelling the
//! context (or letting its deadline pass) makes pending acquires, backoff
//! sleeps and units of work return promptly with `Cancelled` or
//! `DeadlineExceeded`.

use crate::db::transaction::ManagedTransaction;
use crate::error::{DbError, DbResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    transaction: Option<Arc<ManagedTransaction>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .finish()
    }
}

impl Context {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    ///
    /// An earlier deadline already on `self` is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the earlier of `at` and the current deadline.
    pub fn with_deadline(&self, at: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= at => existing,
            _ => at,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Derive a child context that can be cancelled on its own.
    ///
    /// Cancelling the parent still cancels the child.
    pub fn with_cancel(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub(crate) fn with_transaction(&self, tx: Arc<ManagedTransaction>) -> Self {
        Self {
            transaction: Some(tx),
            ..self.clone()
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The transaction this context runs inside, if any.
    pub fn transaction(&self) -> Option<&Arc<ManagedTransaction>> {
        self.transaction.as_ref()
    }

    /// The ambient transaction, or `InvalidInput` outside one.
    pub fn require_transaction(&self) -> DbResult<Arc<ManagedTransaction>> {
        self.transaction
            .clone()
            .ok_or_else(|| DbError::invalid_input("operation requires a transaction context"))
    }

    /// Nesting level a new unit of work started from this context runs at.
    pub fn nest_level(&self) -> u32 {
        self.transaction
            .as_ref()
            .map(|tx| tx.nest_level() + 1)
            .unwrap_or(0)
    }

    /// Fail fast if the context is already done.
    pub fn check(&self, operation: &str) -> DbResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DbError::cancelled(operation));
        }
        if let Some(at) = self.deadline {
            if Instant::now() >= at {
                return Err(DbError::deadline_exceeded(operation));
            }
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the context is cancelled, or the
    /// deadline passes. The future is dropped on cancellation.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        self.check(operation)?;
        let deadline = self.deadline;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DbError::cancelled(operation)),
            _ = sleep_until_opt(deadline) => Err(DbError::deadline_exceeded(operation)),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, returning early with an error if the context
    /// is cancelled or its deadline arrives first.
    pub async fn sleep(&self, duration: Duration) -> DbResult<()> {
        self.check("sleep")?;
        let wake = Instant::now() + duration;
        match self.deadline {
            Some(at) if at <= wake => {
                self.run("backoff", async {
                    tokio::time::sleep_until(at).await;
                    Ok(())
                })
                .await?;
                Err(DbError::deadline_exceeded("backoff"))
            }
            _ => {
                self.run("backoff", async {
                    tokio::time::sleep_until(wake).await;
                    Ok(())
                })
                .await
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
