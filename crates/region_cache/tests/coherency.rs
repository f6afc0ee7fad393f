// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for several clients sharing one store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use region_cache::{
    CacheKey, CacheSettings, Error, FastStrategy, LockConfig, MemoryStore, RegionConfig, RegionFactory, RegionOverrides,
    RegionStrategy, ReplicatedStrategy, StoreOp, StrategyKind, TwoLayerStrategy, VersionedStrategy, build_strategy,
};

const DELIVERY: Duration = Duration::from_millis(50);

fn value(text: &'static str) -> Bytes {
    Bytes::from_static(text.as_bytes())
}

fn quick_locks() -> LockConfig {
    LockConfig::default()
        .with_retry_times(3)
        .with_acquire_timeout(Duration::from_secs(1))
        .with_retry_delay(Duration::from_millis(10), Duration::from_millis(20))
}

#[tokio::test(start_paused = true)]
async fn clients_share_values_and_clears() {
    let store = Arc::new(MemoryStore::new());
    let first = build_strategy(Arc::clone(&store), RegionConfig::new("orders")).await.expect("first");
    let second = build_strategy(Arc::clone(&store), RegionConfig::new("orders")).await.expect("second");
    let key = CacheKey::from("42");

    first.put(&key, value("pending")).await.expect("put");
    assert_eq!(second.get(&key).await.expect("get"), Some(value("pending")));

    second.clear().await.expect("clear");
    tokio::time::sleep(DELIVERY).await;

    assert_eq!(first.get(&key).await.expect("get"), None);
    assert_eq!(second.get(&key).await.expect("get"), None);
}

#[tokio::test(start_paused = true)]
async fn clear_is_seen_even_without_notifications() {
    let store = Arc::new(MemoryStore::new());
    let config = RegionConfig::new("orders").use_pubsub(false);
    let first = build_strategy(Arc::clone(&store), config.clone()).await.expect("first");
    let second = build_strategy(Arc::clone(&store), config).await.expect("second");
    let key = CacheKey::from("42");

    first.put(&key, value("pending")).await.expect("put");
    second.clear().await.expect("clear");

    // The first client still holds the old generation and must notice it is stale.
    assert_eq!(first.get(&key).await.expect("get"), None);
    first.put(&key, value("shipped")).await.expect("put");
    assert_eq!(second.get(&key).await.expect("get"), Some(value("shipped")));
}

#[tokio::test(start_paused = true)]
async fn generations_wrap_at_the_configured_maximum() {
    let store = Arc::new(MemoryStore::new());
    let region = VersionedStrategy::new(store, RegionConfig::new("orders").max_version(5))
        .await
        .expect("region");

    let mut seen = vec![region.generation()];
    for _ in 0..5 {
        region.clear().await.expect("clear");
        seen.push(region.generation());
    }

    assert_eq!(seen, vec![1, 2, 3, 4, 5, 1]);
}

#[tokio::test(start_paused = true)]
async fn locks_exclude_other_clients() {
    let store = Arc::new(MemoryStore::new());
    let config = RegionConfig::new("orders").lock_config(quick_locks());
    let first = build_strategy(Arc::clone(&store), config.clone()).await.expect("first");
    let second = build_strategy(Arc::clone(&store), config).await.expect("second");
    let key = CacheKey::from("42");

    let token = first.lock(&key).await.expect("first lock");
    let error = second.lock(&key).await.expect_err("held by the first client");
    assert!(error.is_lock_acquisition());

    assert!(!second.unlock(&key, &region_cache::LockToken::new()).await.expect("foreign unlock"));
    assert!(first.unlock(&key, &token).await.expect("unlock"));
    let token = second.lock(&key).await.expect("second lock");
    assert!(second.unlock(&key, &token).await.expect("unlock"));
}

#[tokio::test(start_paused = true)]
async fn locks_expire_after_the_key_timeout() {
    let store = Arc::new(MemoryStore::new());
    let config = RegionConfig::new("orders").lock_config(quick_locks().with_key_timeout(Duration::from_secs(2)));
    let first = build_strategy(Arc::clone(&store), config.clone()).await.expect("first");
    let second = build_strategy(Arc::clone(&store), config).await.expect("second");
    let key = CacheKey::from("42");

    let _abandoned = first.lock(&key).await.expect("first lock");
    tokio::time::advance(Duration::from_secs(3)).await;

    second.lock(&key).await.expect("expired lock is free");
}

#[tokio::test(start_paused = true)]
async fn batch_locks_are_all_or_nothing() {
    let store = Arc::new(MemoryStore::new());
    let config = RegionConfig::new("orders").lock_config(quick_locks());
    let first = build_strategy(Arc::clone(&store), config.clone()).await.expect("first");
    let second = build_strategy(Arc::clone(&store), config).await.expect("second");
    let keys: Vec<CacheKey> = (0..10).map(|index| CacheKey::new(&index)).collect();

    let held = first.lock(&keys[5]).await.expect("lock key 5");
    second.lock_many(&keys).await.expect_err("key 5 is held");

    for (index, key) in keys.iter().enumerate().filter(|(index, _)| *index != 5) {
        let token = first.lock(key).await.unwrap_or_else(|_| panic!("key {index} was left locked"));
        assert!(first.unlock(key, &token).await.expect("unlock"));
    }

    assert!(first.unlock(&keys[5], &held).await.expect("unlock"));
    let token = second.lock_many(&keys).await.expect("all free");
    assert_eq!(second.unlock_many(&keys, &token).await.expect("unlock"), 10);
}

#[tokio::test(start_paused = true)]
async fn fast_regions_reject_clear_and_skip_generations() {
    let store = Arc::new(MemoryStore::new());
    let region = FastStrategy::new(Arc::clone(&store), RegionConfig::new("orders").strategy(StrategyKind::Fast))
        .expect("region");
    let key = CacheKey::from("42");

    region.put(&key, value("pending")).await.expect("put");

    assert!(matches!(region.clear().await, Err(Error::Unsupported { .. })));
    assert_eq!(region.get(&key).await.expect("get"), Some(value("pending")));
    assert!(
        !store
            .operations()
            .iter()
            .any(|op| matches!(op, StoreOp::ReadVersion(_) | StoreOp::BumpVersion(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn two_layer_clients_refetch_after_peer_writes() {
    let store = Arc::new(MemoryStore::new());
    let config = RegionConfig::new("orders").strategy(StrategyKind::TwoLayer);
    let first = TwoLayerStrategy::new(Arc::clone(&store), config.clone()).await.expect("first");
    let second = TwoLayerStrategy::new(Arc::clone(&store), config).await.expect("second");
    let key = CacheKey::from("42");

    first.put(&key, value("pending")).await.expect("put");
    assert_eq!(second.get(&key).await.expect("get"), Some(value("pending")));
    assert_eq!(second.local_len(), 1);

    first.put(&key, value("shipped")).await.expect("put");
    tokio::time::sleep(DELIVERY).await;

    store.clear_operations();
    assert_eq!(second.get(&key).await.expect("get"), Some(value("shipped")));
    assert!(store.operations().iter().any(|op| matches!(op, StoreOp::Fetch(_))));

    store.clear_operations();
    assert_eq!(second.get(&key).await.expect("get"), Some(value("shipped")));
    assert!(store.operations().is_empty(), "second read is served locally");
}

#[tokio::test(start_paused = true)]
async fn replicas_converge() {
    let store = Arc::new(MemoryStore::new());
    let config = RegionConfig::new("orders").strategy(StrategyKind::DistributedLocal);
    let first = ReplicatedStrategy::new(Arc::clone(&store), config.clone()).await.expect("first");
    let second = ReplicatedStrategy::new(Arc::clone(&store), config).await.expect("second");
    let key = CacheKey::from("42");

    first.put(&key, value("pending")).await.expect("put");
    tokio::time::sleep(DELIVERY).await;
    second.put(&key, value("shipped")).await.expect("put");
    tokio::time::sleep(DELIVERY).await;

    assert_eq!(first.get(&key).await.expect("get"), Some(value("shipped")));
    assert_eq!(second.get(&key).await.expect("get"), Some(value("shipped")));

    first.remove(&key).await.expect("remove");
    tokio::time::sleep(DELIVERY).await;
    assert_eq!(second.get(&key).await.expect("get"), None);
}

#[tokio::test(start_paused = true)]
async fn sliding_regions_renew_on_read() {
    let store = Arc::new(MemoryStore::new());
    let settings = CacheSettings::default().with_region(
        "foo",
        RegionOverrides {
            expiration: Some(Duration::from_secs(500)),
            use_sliding_expiration: Some(true),
            ..RegionOverrides::default()
        },
    );
    let factory = RegionFactory::new(Arc::clone(&store), settings);
    let foo = factory.region("foo").await.expect("region");
    let stored = foo.strategy().cache_key(&CacheKey::new("k"));

    foo.put("k", &1_u32).await.expect("put");
    assert_eq!(store.raw_ttl(&stored), Some(Duration::from_secs(500)));

    tokio::time::advance(Duration::from_secs(400)).await;
    assert_eq!(foo.get::<_, u32>("k").await.expect("get"), Some(1));
    assert_eq!(store.raw_ttl(&stored), Some(Duration::from_secs(500)));

    tokio::time::advance(Duration::from_secs(501)).await;
    assert_eq!(foo.get::<_, u32>("k").await.expect("get"), None);
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn lock_contention_is_logged() {
    let store = Arc::new(MemoryStore::new());
    let config = RegionConfig::new("orders").lock_config(quick_locks());
    let region = build_strategy(store, config).await.expect("region");
    let key = CacheKey::from("42");

    let _held = region.lock(&key).await.expect("lock");
    region.lock(&key).await.expect_err("already held");

    assert!(logs_contain("failed to acquire lock"));
}

#[tokio::test]
async fn two_layer_regions_need_notifications() {
    let store = Arc::new(MemoryStore::new());
    let config = RegionConfig::new("orders").strategy(StrategyKind::TwoLayer).use_pubsub(false);

    let error = build_strategy(store, config).await.expect_err("local copies would go stale");

    assert!(matches!(error, Error::Configuration(_)), "{error}");
}
