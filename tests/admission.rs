use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_test::{assert_err, assert_ok, assert_pending};

use llmgate::provider::{DASHSCOPE, VOLCENGINE};
use llmgate::ratelimit::FixedWindow;
use llmgate::{MemoryStore, RateLimiter, RateLimiterConfig, SharedCounterStore};

fn limiter(store: &Arc<MemoryStore>, config: RateLimiterConfig) -> Arc<RateLimiter> {
    let config = config.with_backoff(Duration::from_millis(5), Duration::ZERO);
    Arc::new(RateLimiter::new(config, store.clone()).unwrap())
}

#[tokio::test]
async fn test_qpm_ceiling_defers_to_next_window() {
    let store = Arc::new(MemoryStore::new());
    let window = Duration::from_secs(1);
    let limiter = limiter(&store, RateLimiterConfig::new(DASHSCOPE, 3, 10).with_window(window));

    // Start just after a window opens so three admissions fit in it.
    let remaining = FixedWindow::new(window).current().remaining;
    tokio::time::sleep(remaining + Duration::from_millis(10)).await;

    for _ in 0..3 {
        limiter.acquire().await.unwrap().release().await;
    }

    let started = Instant::now();
    let permit = limiter.acquire().await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(500), "waited only {:?}", waited);

    let stats = limiter.get_stats().await.unwrap();
    assert_eq!(stats.current_qpm, 1);
    assert_eq!(stats.total_waits, 1);
    permit.release().await;
}

#[tokio::test]
async fn test_concurrency_ceiling_waits_for_release() {
    let store = Arc::new(MemoryStore::new());
    let limiter = limiter(&store, RateLimiterConfig::new(DASHSCOPE, 100, 2));

    let a = limiter.acquire().await.unwrap();
    let b = limiter.acquire().await.unwrap();

    let mut third = tokio_test::task::spawn(limiter.acquire());
    assert_pending!(third.poll());
    drop(third);

    let waiter = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(limiter.get_stats().await.unwrap().active_requests, 2);

    a.release().await;
    let c = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be admitted after a release")
        .unwrap()
        .unwrap();

    b.release().await;
    c.release().await;
    assert_eq!(limiter.get_stats().await.unwrap().active_requests, 0);
}

#[tokio::test]
async fn test_concurrent_tasks_do_not_leak_slots() {
    let store = Arc::new(MemoryStore::new());
    let limiter = limiter(&store, RateLimiterConfig::new(DASHSCOPE, 10, 5));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                limiter
                    .scoped(async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        assert_ok!(task.unwrap());
    }

    assert!(peak.load(Ordering::SeqCst) <= 5);
    let stats = limiter.get_stats().await.unwrap();
    assert_eq!(stats.active_requests, 0);
    assert_eq!(stats.total_requests, 10);
}

#[tokio::test]
async fn test_aborted_holder_returns_its_slot() {
    let store = Arc::new(MemoryStore::new());
    let limiter = limiter(&store, RateLimiterConfig::new(DASHSCOPE, 100, 1));

    let holder = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let _permit = limiter.acquire().await.unwrap();
            std::future::pending::<()>().await;
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!limiter.can_acquire_now().await.unwrap());

    holder.abort();
    let _ = holder.await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(limiter.get_stats().await.unwrap().active_requests, 0);
    let _ = assert_ok!(limiter.acquire_timeout(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_disabled_limiter_passes_through_without_keys() {
    let store = Arc::new(MemoryStore::new());
    let limiter = limiter(
        &store,
        RateLimiterConfig::new(DASHSCOPE, 0, 0).with_enabled(false),
    );

    let started = Instant::now();
    for _ in 0..100 {
        limiter.acquire().await.unwrap().release().await;
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(store.key_count(), 0);
}

#[tokio::test]
async fn test_limiters_sharing_a_store_share_quota() {
    // Two instances with equal configs stand in for two worker processes.
    let store = Arc::new(MemoryStore::new());
    let worker_a = limiter(&store, RateLimiterConfig::new(VOLCENGINE, 100, 1).with_endpoint("ark-kimi"));
    let worker_b = limiter(&store, RateLimiterConfig::new(VOLCENGINE, 100, 1).with_endpoint("ark-kimi"));

    let permit = worker_a.acquire().await.unwrap();
    assert!(!worker_b.can_acquire_now().await.unwrap());
    let err = assert_err!(worker_b.acquire_timeout(Duration::from_millis(50)).await);
    assert!(err.is_timeout());

    permit.release().await;
    let _ = assert_ok!(worker_b.acquire_timeout(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_endpoint_limiters_are_independent() {
    let store = Arc::new(MemoryStore::new());
    let kimi = limiter(&store, RateLimiterConfig::new(VOLCENGINE, 100, 1).with_endpoint("ark-kimi"));
    let doubao = limiter(&store, RateLimiterConfig::new(VOLCENGINE, 100, 1).with_endpoint("ark-doubao"));

    let held = kimi.acquire().await.unwrap();
    assert!(doubao.can_acquire_now().await.unwrap());
    held.release().await;
}

#[tokio::test]
async fn test_endpoint_validation() {
    let store: Arc<dyn SharedCounterStore> = Arc::new(MemoryStore::new());

    let missing = RateLimiter::new(RateLimiterConfig::new(VOLCENGINE, 10, 1), store.clone());
    assert!(missing.unwrap_err().is_config());

    let invalid = RateLimiter::new(
        RateLimiterConfig::new(VOLCENGINE, 10, 1).with_endpoint("invalid-endpoint"),
        store.clone(),
    );
    let err = invalid.unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("invalid-endpoint"));

    for endpoint in ["ark-deepseek", "ark-kimi", "ark-doubao"] {
        let valid = RateLimiter::new(
            RateLimiterConfig::new(VOLCENGINE, 10, 1).with_endpoint(endpoint),
            store.clone(),
        );
        assert_eq!(valid.unwrap().target().endpoint.as_deref(), Some(endpoint));
    }
}

#[tokio::test]
async fn test_store_outage_is_distinct_from_saturation() {
    let store = Arc::new(MemoryStore::new());
    let limiter = limiter(&store, RateLimiterConfig::new(DASHSCOPE, 10, 1));

    store.set_offline(true);
    let err = limiter.acquire_timeout(Duration::from_millis(100)).await.unwrap_err();
    assert!(err.is_transient());
    assert!(!err.is_timeout());
}
