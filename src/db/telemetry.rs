//! Observability collaborator.
//!
//! Components report acquire/release, cache lookups and transaction phase
//! boundaries to an [`Observer`]. Every method has a no-op default so the
//! runtime works without one.

use crate::models::{DatabaseType, TxOutcome, TxPhase};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub trait Observer: Send + Sync {
    fn connection_acquired(&self, _kind: DatabaseType, _wait: Duration) {}

    fn connection_released(&self, _kind: DatabaseType, _recycled: bool) {}

    /// `cache` is `"statement"` or `"query"`.
    fn cache_lookup(&self, _cache: &'static str, _hit: bool) {}

    fn transaction_phase(&self, _transaction_id: &str, _phase: TxPhase) {}

    fn transaction_finished(
        &self,
        _transaction_id: &str,
        _outcome: TxOutcome,
        _attempts: u32,
        _elapsed: Duration,
    ) {
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Emits every observation as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn connection_acquired(&self, kind: DatabaseType, wait: Duration) {
        trace!(%kind, wait_ms = wait.as_millis() as u64, "connection acquired");
    }

    fn connection_released(&self, kind: DatabaseType, recycled: bool) {
        trace!(%kind, recycled, "connection released");
    }

    fn cache_lookup(&self, cache: &'static str, hit: bool) {
        trace!(cache, hit, "cache lookup");
    }

    fn transaction_phase(&self, transaction_id: &str, phase: TxPhase) {
        trace!(transaction_id, %phase, "transaction phase");
    }

    fn transaction_finished(
        &self,
        transaction_id: &str,
        outcome: TxOutcome,
        attempts: u32,
        elapsed: Duration,
    ) {
        debug!(
            transaction_id,
            ?outcome,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "transaction finished"
        );
    }
}

/// Shared observer handle; defaults to [`NoopObserver`].
pub type SharedObserver = Arc<dyn Observer>;

pub fn noop() -> SharedObserver {
    Arc::new(NoopObserver)
}
