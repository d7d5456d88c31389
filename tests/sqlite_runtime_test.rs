//! End-to-end runtime tests against a SQLite file.

use db_runtime::config::{DatabaseConfig, PoolConfig, RuntimeConfig};
use db_runtime::db::{HookPhase, SqliteConnector};
use db_runtime::db::telemetry::noop;
use db_runtime::models::row_i64;
use db_runtime::{Context, DbError, DbResult, DbRuntime, QueryParam};
use std::sync::Arc;
use tempfile::NamedTempFile;

const CREATE: &str = "CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)";
const INSERT: &str = "INSERT INTO items (name) VALUES (?)";
const COUNT: &str = "SELECT COUNT(*) AS n FROM items";
const NAMES: &str = "SELECT name FROM items ORDER BY id";

async fn open(file: &NamedTempFile) -> DbRuntime {
    let url = format!("sqlite:{}?mode=rwc", file.path().display());
    let config = RuntimeConfig {
        pool: PoolConfig {
            min_connections: 1,
            max_connections: 2,
            ..PoolConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let runtime = DbRuntime::open(config, Arc::new(SqliteConnector::new(&url).unwrap()))
        .await
        .unwrap();
    runtime
        .execute(&Context::background(), CREATE, &[])
        .await
        .unwrap();
    runtime
}

async fn count(runtime: &DbRuntime) -> i64 {
    let rows = runtime
        .query(&Context::background(), COUNT, &[])
        .await
        .unwrap();
    row_i64(&rows[0], "n").unwrap()
}

async fn names(runtime: &DbRuntime) -> Vec<String> {
    runtime
        .query(&Context::background(), NAMES, &[])
        .await
        .unwrap()
        .iter()
        .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(String::from))
        .collect()
}

async fn insert(ctx: &Context, name: &str) -> DbResult<()> {
    ctx.require_transaction()?
        .execute(INSERT, &[QueryParam::from(name)])
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_commit_is_visible_outside_transaction() {
    let file = NamedTempFile::new().unwrap();
    let runtime = open(&file).await;

    runtime
        .execute_in_transaction(&Context::background(), |ctx| async move {
            insert(&ctx, "alpha").await?;
            insert(&ctx, "beta").await
        })
        .await
        .unwrap();

    assert_eq!(names(&runtime).await, vec!["alpha", "beta"]);
    runtime.close().await;
}

#[tokio::test]
async fn test_failed_transaction_leaves_no_rows() {
    let file = NamedTempFile::new().unwrap();
    let runtime = open(&file).await;

    let result: DbResult<()> = runtime
        .execute_in_transaction(&Context::background(), |ctx| async move {
            insert(&ctx, "ghost").await?;
            Err(DbError::invalid_input("validation failed"))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(count(&runtime).await, 0);
    runtime.close().await;
}

#[tokio::test]
async fn test_nested_rollback_undoes_inner_work_only() {
    let file = NamedTempFile::new().unwrap();
    let runtime = open(&file).await;
    let rt = &runtime;

    rt.execute_in_transaction(&Context::background(), |ctx| async move {
        insert(&ctx, "outer").await?;
        let nested: DbResult<()> = rt
            .execute_in_transaction(&ctx, |inner| async move {
                insert(&inner, "inner").await?;
                Err(DbError::invalid_input("inner failed"))
            })
            .await;
        assert!(nested.is_err());
        insert(&ctx, "after").await
    })
    .await
    .unwrap();

    assert_eq!(names(&runtime).await, vec!["outer", "after"]);
    runtime.close().await;
}

#[tokio::test]
async fn test_manual_savepoint_undo() {
    let file = NamedTempFile::new().unwrap();
    let runtime = open(&file).await;

    runtime
        .execute_in_transaction(&Context::background(), |ctx| async move {
            let tx = ctx.require_transaction()?;
            insert(&ctx, "kept").await?;
            tx.create_savepoint("before_bulk").await?;
            insert(&ctx, "undone_1").await?;
            insert(&ctx, "undone_2").await?;
            tx.rollback_to_savepoint("before_bulk").await?;
            tx.release_savepoint("before_bulk").await
        })
        .await
        .unwrap();

    assert_eq!(names(&runtime).await, vec!["kept"]);
    runtime.close().await;
}

#[tokio::test]
async fn test_statement_cache_reused_across_transactions() {
    let file = NamedTempFile::new().unwrap();
    let runtime = open(&file).await;

    for i in 0..5 {
        let name = format!("row_{}", i);
        runtime
            .execute_in_transaction(&Context::background(), |ctx| {
                let name = name.clone();
                async move { insert(&ctx, &name).await }
            })
            .await
            .unwrap();
    }

    let stats = runtime.statements().stats();
    assert!(stats.hits >= 4, "{:?}", stats);
    assert_eq!(count(&runtime).await, 5);
    runtime.close().await;
}

#[tokio::test]
async fn test_commit_invalidates_query_cache() {
    let file = NamedTempFile::new().unwrap();
    let runtime = open(&file).await;
    let cache = runtime.query_cache::<i64>();
    let ctx = Context::background();

    let load = || async { Ok(count(&runtime).await) };
    assert_eq!(cache.get(&ctx, "items:count", load).await.unwrap(), 0);

    // A rolled-back transaction leaves the cached value alone.
    let _: DbResult<()> = runtime
        .execute_in_transaction(&ctx, |ctx| async move {
            insert(&ctx, "rolled_back").await?;
            ctx.require_transaction()?.invalidate_on_commit("items:*");
            Err(DbError::invalid_input("abort"))
        })
        .await;
    assert_eq!(cache.get(&ctx, "items:count", load).await.unwrap(), 0);

    runtime
        .execute_in_transaction(&ctx, |ctx| async move {
            insert(&ctx, "committed").await?;
            ctx.require_transaction()?.invalidate_on_commit("items:*");
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(cache.get(&ctx, "items:count", load).await.unwrap(), 1);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
    runtime.close().await;
}

#[tokio::test]
async fn test_query_cache_is_shared_per_value_type() {
    let file = NamedTempFile::new().unwrap();
    let runtime = open(&file).await;

    let first = runtime.query_cache::<i64>();
    for _ in 0..100 {
        assert!(Arc::ptr_eq(&first, &runtime.query_cache::<i64>()));
    }
    assert_eq!(runtime.hooks().count(HookPhase::AfterCommit), 1);

    let _names = runtime.query_cache::<Vec<String>>();
    assert_eq!(runtime.hooks().count(HookPhase::AfterCommit), 2);
    runtime.close().await;
}

#[tokio::test]
async fn test_close_releases_everything() {
    let file = NamedTempFile::new().unwrap();
    let runtime = open(&file).await;
    runtime.close().await;

    assert!(runtime.pool().is_closed());
    assert_eq!(runtime.scopes().count(), 0);
    assert!(runtime.statements().is_empty());
    let result = runtime.query(&Context::background(), COUNT, &[]).await;
    assert!(matches!(result, Err(DbError::PoolClosed)));
}

#[tokio::test]
async fn test_connect_requires_bundled_driver() {
    let db = DatabaseConfig::parse("postgres://localhost:5432/app").unwrap();
    let result = DbRuntime::connect(&db, RuntimeConfig::default(), noop()).await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
}
