//! Workload driver for the database runtime.
//!
//! Opens a runtime against one database, runs concurrent transactional
//! workers against a demo table and prints pool and cache statistics as JSON.

use db_runtime::config::Config;
use db_runtime::db::TracingObserver;
use db_runtime::models::row_i64;
use db_runtime::{Context, DbError, DbResult, DbRuntime, QueryParam};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS dbrt_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    note TEXT
)";
const INSERT_EVENT: &str = "INSERT INTO dbrt_events (worker, seq, note) VALUES (?, ?, ?)";
const COUNT_EVENTS: &str = "SELECT COUNT(*) AS n FROM dbrt_events";
const COUNT_KEY: &str = "events:count";

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[derive(Default)]
struct Tally {
    committed: AtomicU64,
    failed: AtomicU64,
    nested_rollbacks: AtomicU64,
}

/// One transaction: insert an event and, every fifth time, a nested insert
/// that is rolled back to its savepoint.
async fn run_once(runtime: &Arc<DbRuntime>, ctx: &Context, worker: i64, seq: i64, tally: &Arc<Tally>) -> DbResult<()> {
    let rt = Arc::clone(runtime);
    let tally = Arc::clone(tally);
    runtime
        .execute_in_transaction(ctx, move |tctx| {
            let rt = Arc::clone(&rt);
            let tally = Arc::clone(&tally);
            async move {
                let tx = tctx.require_transaction()?;
                tx.execute(
                    INSERT_EVENT,
                    &[QueryParam::from(worker), QueryParam::from(seq), QueryParam::from("kept")],
                )
                .await?;

                if seq % 5 == 0 {
                    let nested = rt
                        .transactions()
                        .execute_in_transaction(&tctx, move |nctx| async move {
                            let ntx = nctx.require_transaction()?;
                            ntx.execute(
                                INSERT_EVENT,
                                &[QueryParam::from(worker), QueryParam::from(seq), QueryParam::from("discarded")],
                            )
                            .await?;
                            Err::<(), _>(DbError::invalid_input("nested work abandoned"))
                        })
                        .await;
                    if nested.is_err() {
                        tally.nested_rollbacks.fetch_add(1, Ordering::Relaxed);
                    }
                }

                tx.invalidate_on_commit("events:*");
                Ok(())
            }
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    let db = config.parse_database()?;
    info!(
        id = %db.id,
        workers = config.workers,
        iterations = config.iterations,
        "Starting db-runtime workload v{}",
        env!("CARGO_PKG_VERSION")
    );

    let runtime = Arc::new(
        DbRuntime::connect(&db, config.runtime_config(&db), Arc::new(TracingObserver)).await?,
    );
    let counts = runtime.query_cache::<i64>();
    let ctx = Context::background();

    runtime.execute(&ctx, CREATE_TABLE, &[]).await?;

    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping workers");
            interrupt.cancel();
        }
    });

    let tally = Arc::new(Tally::default());
    let started = Instant::now();
    let mut workers = Vec::with_capacity(config.workers);

    for worker in 0..config.workers {
        let runtime = Arc::clone(&runtime);
        let counts = Arc::clone(&counts);
        let tally = Arc::clone(&tally);
        let ctx = ctx.clone();
        let iterations = config.iterations;

        workers.push(tokio::spawn(async move {
            for seq in 0..iterations {
                if ctx.is_cancelled() {
                    break;
                }
                match run_once(&runtime, &ctx, worker as i64, seq as i64, &tally).await {
                    Ok(()) => {
                        tally.committed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tally.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(worker, seq, error = %e, "Transaction failed");
                        continue;
                    }
                }

                let count = counts
                    .get(&ctx, COUNT_KEY, || async {
                        let rows = runtime.query(&ctx, COUNT_EVENTS, &[]).await?;
                        Ok(rows.first().and_then(|r| row_i64(r, "n")).unwrap_or(0))
                    })
                    .await;
                match count {
                    Ok(n) => debug!(worker, seq, events = n, "Event count"),
                    Err(e) => warn!(worker, seq, error = %e, "Count query failed"),
                }
            }
        }));
    }

    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task panicked");
        }
    }

    let summary = serde_json::json!({
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "committed": tally.committed.load(Ordering::Relaxed),
        "failed": tally.failed.load(Ordering::Relaxed),
        "nested_rollbacks": tally.nested_rollbacks.load(Ordering::Relaxed),
        "pool": runtime.pool().stats(),
        "statement_cache": runtime.statements().stats(),
        "query_cache": counts.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    runtime.close().await;
    info!("Workload complete");
    Ok(())
}
