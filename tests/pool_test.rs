//! Connection pool behaviour against the in-memory driver.

mod common;

use common::{MockConnector, pool_config};
use db_runtime::db::ConnectionPool;
use db_runtime::{Context, DbError};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_pool_opens_min_connections() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(2, 4), Arc::new(connector.clone()))
        .await
        .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.borrowed, 0);
    assert_eq!(connector.state.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejects_invalid_config() {
    let result = ConnectionPool::new(pool_config(5, 2), Arc::new(MockConnector::new())).await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(0, 2), Arc::new(connector.clone()))
        .await
        .unwrap();
    let ctx = Context::background();

    let first = assert_ok!(pool.acquire(&ctx).await);
    let id = first.id();
    assert_ok!(pool.release(first).await);

    let second = assert_ok!(pool.acquire(&ctx).await);
    assert_eq!(second.id(), id);
    assert_eq!(second.borrow_count(), 2);
    assert_eq!(connector.state.connects.load(Ordering::SeqCst), 1);
    second.release().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_borrowers_never_exceed_max() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(1, 3), Arc::new(connector.clone()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let ctx = Context::background().with_timeout(Duration::from_secs(10));
            for _ in 0..20 {
                let conn = pool.acquire(&ctx).await.unwrap();
                let stats = pool.stats();
                assert!(stats.open() <= stats.max_connections, "{:?}", stats);
                let delay = rand::thread_rng().gen_range(0..3);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                pool.release(conn).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.borrows, 240);
    assert_eq!(stats.returns, 240);
    assert!(connector.state.connects.load(Ordering::SeqCst) <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_times_out_when_exhausted() {
    let pool = ConnectionPool::new(pool_config(0, 1), Arc::new(MockConnector::new()))
        .await
        .unwrap();
    let ctx = Context::background();
    let held = pool.acquire(&ctx).await.unwrap();

    let result = pool.acquire(&ctx).await;
    assert!(matches!(result, Err(DbError::Timeout { .. })));
    assert_eq!(pool.stats().errors, 1);

    pool.release(held).await.unwrap();
    let conn = assert_ok!(pool.acquire(&ctx).await);
    conn.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_context_deadline_shorter_than_acquire_timeout() {
    let pool = ConnectionPool::new(pool_config(0, 1), Arc::new(MockConnector::new()))
        .await
        .unwrap();
    let held = pool.acquire(&Context::background()).await.unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let result = pool.acquire(&ctx).await;
    assert!(matches!(result, Err(DbError::DeadlineExceeded { .. })));

    pool.release(held).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_waiter_wakes_on_release() {
    let pool = ConnectionPool::new(pool_config(0, 1), Arc::new(MockConnector::new()))
        .await
        .unwrap();
    let held = pool.acquire(&Context::background()).await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(&Context::background()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.release(held).await.unwrap();

    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.id(), held_id);
    conn.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting() {
    let pool = ConnectionPool::new(pool_config(0, 1), Arc::new(MockConnector::new()))
        .await
        .unwrap();
    let held = pool.acquire(&Context::background()).await.unwrap();

    let ctx = Context::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let result = pool.acquire(&ctx).await;
    assert!(matches!(result, Err(DbError::Cancelled { .. })));
    assert_eq!(pool.stats().borrowed, 1);

    pool.release(held).await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_frees_the_slot() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(0, 1), Arc::new(connector.clone()))
        .await
        .unwrap();
    let ctx = Context::background();

    connector.state.fail_connect.store(true, Ordering::SeqCst);
    let err = assert_err!(pool.acquire(&ctx).await);
    assert!(err.is_connection_failure());
    assert_eq!(pool.stats().pending, 0);

    connector.state.fail_connect.store(false, Ordering::SeqCst);
    let conn = pool.acquire(&ctx).await.unwrap();
    conn.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_lifetime_is_recycled() {
    let connector = MockConnector::new();
    let mut config = pool_config(0, 2);
    config.max_lifetime = Duration::from_secs(1);
    let pool = ConnectionPool::new(config, Arc::new(connector.clone()))
        .await
        .unwrap();
    let ctx = Context::background();

    let conn = pool.acquire(&ctx).await.unwrap();
    let first_id = conn.id();
    pool.release(conn).await.unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;

    let conn = pool.acquire(&ctx).await.unwrap();
    assert_ne!(conn.id(), first_id);
    pool.release(conn).await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.lifetime_expired, 1);
    assert_eq!(connector.state.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unhealthy_connection_closed_on_release() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(0, 2), Arc::new(connector.clone()))
        .await
        .unwrap();

    let mut conn = pool.acquire(&Context::background()).await.unwrap();
    conn.mark_unhealthy();
    pool.release(conn).await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.unhealthy, 1);
    assert_eq!(connector.state.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_health_check_replaces_failed_connections() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(2, 4), Arc::new(connector.clone()))
        .await
        .unwrap();

    connector.state.fail_validate.store(true, Ordering::SeqCst);
    let discarded = pool.run_health_check().await;
    assert_eq!(discarded, 2);

    let stats = pool.stats();
    assert_eq!(stats.idle, 2, "pool should be topped back up to min");
    assert_eq!(stats.health_checks, 2);
    assert_eq!(connector.state.connects.load(Ordering::SeqCst), 4);

    connector.state.fail_validate.store(false, Ordering::SeqCst);
    assert_eq!(pool.run_health_check().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_health_check_returns_reservations() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(2, 4), Arc::new(connector.clone()))
        .await
        .unwrap();

    connector.state.stall_validate.store(true, Ordering::SeqCst);
    tokio::select! {
        _ = pool.run_health_check() => panic!("health check should still be validating"),
        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
    }
    tokio::time::sleep(Duration::from_millis(1)).await;

    let stats = pool.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(connector.state.open_connections(), 0);
    assert_eq!(connector.state.closes.load(Ordering::SeqCst), 2);

    connector.state.stall_validate.store(false, Ordering::SeqCst);
    let conn = pool.acquire(&Context::background()).await.unwrap();
    conn.release().await.unwrap();
}

#[tokio::test]
async fn test_close_refuses_borrows_and_closes_returns() {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(pool_config(1, 2), Arc::new(connector.clone()))
        .await
        .unwrap();
    let ctx = Context::background();
    let held = pool.acquire(&ctx).await.unwrap();

    pool.close().await;
    assert!(pool.is_closed());
    assert!(matches!(pool.acquire(&ctx).await, Err(DbError::PoolClosed)));

    pool.release(held).await.unwrap();
    assert_eq!(connector.state.open_connections(), 0);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test]
async fn test_release_to_foreign_pool_is_rejected() {
    let a = ConnectionPool::new(pool_config(0, 1), Arc::new(MockConnector::new()))
        .await
        .unwrap();
    let b = ConnectionPool::new(pool_config(0, 1), Arc::new(MockConnector::new()))
        .await
        .unwrap();

    let conn = a.acquire(&Context::background()).await.unwrap();
    let result = b.release(conn).await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
}
