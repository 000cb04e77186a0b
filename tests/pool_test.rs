//! Tests for the pool facade: growth, statistics, saturation, fairness

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tarn::error::{Error, ErrorCategory};
use tarn::pool::SessionPool;
use tokio::sync::mpsc;

use support::{test_config, MockBackend, MockFactory, RecordingListener};

async fn pool(min: usize, max: usize) -> (SessionPool, Arc<MockBackend>) {
    let backend = MockBackend::new();
    let factory = MockFactory::new(backend.clone());
    let pool = SessionPool::new(test_config(min, max), factory)
        .await
        .expect("pool builds");
    (pool, backend)
}

// ==================== Growth ====================

#[tokio::test]
async fn test_pool_grows_above_min_under_load() {
    let (pool, _backend) = pool(2, 4).await;

    let c1 = pool.acquire().await.unwrap();
    let c2 = pool.acquire().await.unwrap();

    let status = pool.status(false);
    assert_eq!(status.busy, 2);
    assert_eq!(status.free, 0);

    let c3 = pool.acquire().await.unwrap();
    let status = pool.status(false);
    assert_eq!(status.busy, 3);
    assert_eq!(status.free, 0);

    drop(c2);
    let status = pool.status(false);
    assert_eq!(status.busy, 2);
    assert_eq!(status.free, 1);

    drop(c3);
    let status = pool.status(false);
    assert_eq!(status.busy, 1);
    assert_eq!(status.free, 2);

    drop(c1);
    let status = pool.status(false);
    assert_eq!(status.busy, 0);
    assert_eq!(status.free, 3);

    assert_eq!(pool.status(false).high_water_mark, 3);
    assert_eq!(pool.status(false).hit_count, 3);
}

#[tokio::test]
async fn test_round_trip_is_lifo() {
    let (pool, _backend) = pool(2, 4).await;

    let first = pool.acquire().await.unwrap();
    let id = first.id();
    drop(first);

    let again = pool.acquire().await.unwrap();
    assert_eq!(again.id(), id);
}

// ==================== Statistics ====================

#[tokio::test]
async fn test_borrow_time_statistics() {
    let (pool, _backend) = pool(2, 4).await;
    pool.statistics(true);

    let c1 = pool.acquire().await.unwrap();
    let c2 = pool.acquire().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(c1);
    drop(c2);

    let stats = pool.statistics(false);
    assert_eq!(stats.count, 2);
    assert!(stats.total_micros >= 190_000, "total {}", stats.total_micros);
    assert!(stats.hwm_micros >= 90_000, "hwm {}", stats.hwm_micros);
    assert!(stats.avg_micros() >= 90_000, "avg {}", stats.avg_micros());

    pool.statistics(true);
    assert_eq!(pool.statistics(false).count, 0);
}

// ==================== Saturation ====================

#[tokio::test]
async fn test_saturated_pool_times_out() {
    let backend = MockBackend::new();
    let factory = MockFactory::new(backend.clone());
    let config = test_config(1, 1).with_wait_timeout(Duration::from_millis(50));
    let pool = SessionPool::new(config, factory).await.unwrap();

    let held = pool.acquire().await.unwrap();

    let started = Instant::now();
    let err = pool.acquire().await.expect_err("pool is saturated");
    let elapsed = started.elapsed();

    match &err {
        Error::Timeout {
            status,
            busy_report,
            ..
        } => {
            assert_eq!(status.busy, 1);
            assert_eq!(status.free, 0);
            assert!(busy_report.contains("test.1"), "report: {busy_report}");
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(elapsed >= Duration::from_millis(45), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "elapsed {elapsed:?}");
    assert_eq!(pool.status(false).wait_count, 1);

    drop(held);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_served_in_fifo_order() {
    let backend = MockBackend::new();
    let factory = MockFactory::new(backend.clone());
    let config = test_config(1, 1).with_wait_timeout(Duration::from_secs(5));
    let pool = SessionPool::new(config, factory).await.unwrap();

    let held = pool.acquire().await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<u32>();

    let p1 = pool.clone();
    let tx1 = tx.clone();
    let w1 = tokio::spawn(async move {
        let handle = p1.acquire().await.unwrap();
        tx1.send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);
    });

    // Make sure the first waiter is parked before the second arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let p2 = pool.clone();
    let tx2 = tx.clone();
    let w2 = tokio::spawn(async move {
        let handle = p2.acquire().await.unwrap();
        tx2.send(2).unwrap();
        drop(handle);
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.status(false).waiting, 2);

    drop(held);
    w1.await.unwrap();
    w2.await.unwrap();

    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, Some(2));
    assert_eq!(pool.status(false).wait_count, 2);
}

// ==================== Resize ====================

#[tokio::test]
async fn test_shrinking_max_destroys_on_return() {
    let (pool, backend) = pool(0, 2).await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    pool.set_max_size(1);

    drop(a);
    let status = pool.status(false);
    assert_eq!(status.busy, 1);
    assert_eq!(status.free, 0);

    drop(b);
    let status = pool.status(false);
    assert_eq!(status.busy, 0);
    assert_eq!(status.free, 1);

    // Exactly one backend session destroyed by the shrink.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.closed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raising_max_unblocks_waiter() {
    let backend = MockBackend::new();
    let factory = MockFactory::new(backend.clone());
    let config = test_config(0, 1).with_wait_timeout(Duration::from_secs(5));
    let pool = SessionPool::new(config, factory).await.unwrap();

    let held = pool.acquire().await.unwrap();
    let p2 = pool.clone();
    let waiter = tokio::spawn(async move { p2.acquire().await.map(|h| h.id()) });

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.set_max_size(2);

    let acquired = waiter.await.unwrap();
    assert!(acquired.is_ok());
    drop(held);
}

// ==================== Shutdown ====================

#[tokio::test]
async fn test_acquire_after_shutdown_fails() {
    let (pool, _backend) = pool(1, 2).await;

    pool.shutdown(false).await;
    let err = pool.acquire().await.expect_err("pool is closed");
    assert!(matches!(err, Error::PoolClosed));

    // Shutdown is idempotent.
    pool.shutdown(false).await;
}

#[tokio::test]
async fn test_shutdown_closes_free_sessions() {
    let (pool, backend) = pool(2, 4).await;
    assert_eq!(pool.status(false).free, 2);

    pool.shutdown(false).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.closed(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_busy_return() {
    let (pool, backend) = pool(0, 2).await;

    let held = pool.acquire().await.unwrap();
    let p2 = pool.clone();
    let returner = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(held);
    });

    pool.shutdown(false).await;
    returner.await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.closed(), 1);
    assert_eq!(p2.status(false).busy, 0);
}

// ==================== Unpooled sessions ====================

#[tokio::test]
async fn test_unpooled_session_bypasses_pool() {
    let (pool, backend) = pool(0, 2).await;

    let raw = pool.acquire_unpooled().await.unwrap();
    let status = pool.status(false);
    assert_eq!(status.busy, 0);
    assert_eq!(status.free, 0);

    raw.close().await.unwrap();
    assert_eq!(backend.closed(), 1);
}

#[tokio::test]
async fn test_credential_override_declined_by_default() {
    let (pool, _backend) = pool(0, 2).await;

    let err = match pool.acquire_with_credentials("other", "secret").await {
        Err(e) => e,
        Ok(_) => panic!("mock factory has no override support"),
    };
    assert_eq!(err.category(), ErrorCategory::Unsupported);
}

// ==================== Listener hooks ====================

#[tokio::test]
async fn test_listener_sees_acquire_and_release() {
    let backend = MockBackend::new();
    let factory = MockFactory::new(backend.clone());
    let listener = RecordingListener::new();
    let pool = SessionPool::builder(test_config(0, 2), factory)
        .listener(listener.clone())
        .build()
        .await
        .unwrap();

    let handle = pool.acquire().await.unwrap();
    assert_eq!(listener.acquired.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(listener.released.load(std::sync::atomic::Ordering::SeqCst), 0);

    drop(handle);
    assert_eq!(listener.released.load(std::sync::atomic::Ordering::SeqCst), 1);
}
