//! Idle and lifetime eviction behavior.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use spillway_core::{ConnectionConfig, PoolConfig};
use spillway_pool::testing::MockFactory;
use spillway_pool::{ConnectionPool, ThrottleTracker};

fn identity(name: &str) -> ConnectionConfig {
    ConnectionConfig::new(name, Url::parse("https://bulk.example.com/api").unwrap())
}

fn pool_with(factory: Arc<MockFactory>, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(
        vec![identity("a")],
        factory,
        config,
        Arc::new(ThrottleTracker::new()),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn channel_past_lifetime_is_closed_on_release() {
    let factory = Arc::new(MockFactory::new());
    let config = PoolConfig::builder()
        .max_idle_time(Duration::from_millis(500))
        .max_lifetime(Duration::from_secs(1))
        .eviction_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let pool = pool_with(factory.clone(), config);
    let cancel = CancellationToken::new();

    let channel = pool.acquire(&cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    drop(channel);

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn lifetime_expired_idle_is_not_handed_out_again() {
    let factory = Arc::new(MockFactory::new());
    let config = PoolConfig::builder()
        .max_idle_time(Duration::from_secs(30))
        .max_lifetime(Duration::from_secs(60))
        .eviction_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let pool = pool_with(factory.clone(), config);
    let cancel = CancellationToken::new();

    let channel = pool.acquire(&cancel).await.unwrap();
    drop(channel);
    tokio::time::advance(Duration::from_secs(61)).await;

    let channel = pool.acquire(&cancel).await.unwrap();
    assert_eq!(factory.creates_for("a"), 2);
    assert_eq!(factory.closed(), 1);
    drop(channel);
}

#[tokio::test(start_paused = true)]
async fn background_pulse_evicts_idle_channels() {
    let factory = Arc::new(MockFactory::new());
    let config = PoolConfig::builder()
        .min_pool_size(0)
        .max_idle_time(Duration::from_millis(500))
        .max_lifetime(Duration::from_secs(3600))
        .eviction_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let pool = pool_with(factory.clone(), config);
    let cancel = CancellationToken::new();

    let channel = pool.acquire(&cancel).await.unwrap();
    drop(channel);
    assert_eq!(pool.stats().idle, 1);

    // Two pulse periods pass with the channel idle past its threshold.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(pool.stats().idle, 0);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn min_pool_size_shields_idles_from_idle_eviction() {
    let factory = Arc::new(MockFactory::new());
    let config = PoolConfig::builder()
        .min_pool_size(1)
        .max_idle_time(Duration::from_millis(500))
        .max_lifetime(Duration::from_secs(3600))
        .eviction_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let pool = pool_with(factory.clone(), config);
    let cancel = CancellationToken::new();

    let channel = pool.acquire(&cancel).await.unwrap();
    drop(channel);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(pool.stats().idle, 1);
    assert_eq!(factory.closed(), 0);
}
