// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tests against a running Redis server.
//!
//! Ignored by default. Run with `cargo test -- --ignored`, pointing `REDIS_URL` at a
//! disposable server.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use region_cache::{
    CacheKey, FetchOptions, LockToken, RegionConfig, RegionStore, RegionStrategy, StoreEvent, StrategyKind, VersionGuard,
    Versioned, build_strategy,
};
use region_cache_redis::RedisStore;

fn unique(name: &str) -> String {
    format!("{name}-{}", LockToken::new())
}

async fn store() -> Arc<RedisStore> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_owned());
    Arc::new(RedisStore::connect(&url).await.expect("redis server"))
}

#[tokio::test]
#[ignore = "needs a Redis server"]
async fn guarded_calls_detect_stale_generations() {
    let store = store().await;
    let version_key = unique("version");
    let data_key = unique("data");

    assert_eq!(store.read_version(&version_key).await.expect("read"), 1);
    let guard = VersionGuard {
        key: version_key.clone(),
        expected: 1,
    };
    let stored = store
        .store(&[(data_key.clone(), Bytes::from_static(b"v"))], Some(Duration::from_secs(60)), Some(&guard), None)
        .await
        .expect("store");
    assert_eq!(stored, Versioned::Current(()));

    assert_eq!(store.bump_version(&version_key, 1000).await.expect("bump"), 2);
    let fetched = store
        .fetch(&[data_key], FetchOptions::default(), Some(&guard))
        .await
        .expect("fetch");
    assert!(fetched.is_stale());
}

#[tokio::test]
#[ignore = "needs a Redis server"]
async fn versions_wrap() {
    let store = store().await;
    let version_key = unique("version");

    let mut seen = vec![store.read_version(&version_key).await.expect("read")];
    for _ in 0..5 {
        seen.push(store.bump_version(&version_key, 5).await.expect("bump"));
    }

    assert_eq!(seen, vec![1, 2, 3, 4, 5, 1]);
}

#[tokio::test]
#[ignore = "needs a Redis server"]
async fn fetch_reports_residual_ttl() {
    let store = store().await;
    let key = unique("data");

    store
        .store(&[(key.clone(), Bytes::from_static(b"v"))], Some(Duration::from_secs(500)), None, None)
        .await
        .expect("store");
    let options = FetchOptions {
        sliding_ttl: None,
        with_ttl: true,
    };
    let fetched = store.fetch(&[key], options, None).await.expect("fetch").current().expect("unguarded");

    let ttl = fetched[0].as_ref().and_then(|fetched| fetched.ttl).expect("expiring key");
    assert!(ttl <= Duration::from_secs(500) && ttl > Duration::from_secs(490));
}

#[tokio::test]
#[ignore = "needs a Redis server"]
async fn writes_notify_subscribers() {
    let store = store().await;
    let channel = unique("sync");
    let mut subscription = store.subscribe(&channel).await.expect("subscribe");
    let publication = region_cache::Publication {
        channel: channel.clone(),
        payload: Bytes::from_static(b"hello"),
    };

    store
        .store(&[(unique("data"), Bytes::from_static(b"v"))], None, None, Some(&publication))
        .await
        .expect("store");

    let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("delivered");
    assert_eq!(event, Some(StoreEvent::Message(Bytes::from_static(b"hello"))));
}

#[tokio::test]
#[ignore = "needs a Redis server"]
async fn regions_work_end_to_end() {
    let store = store().await;
    let config = RegionConfig::new(unique("orders")).strategy(StrategyKind::TwoLayer);
    let first = build_strategy(Arc::clone(&store), config.clone()).await.expect("first");
    let second = build_strategy(Arc::clone(&store), config).await.expect("second");
    let key = CacheKey::from("42");

    first.put(&key, Bytes::from_static(b"pending")).await.expect("put");
    assert_eq!(second.get(&key).await.expect("get"), Some(Bytes::from_static(b"pending")));

    let token = first.lock(&key).await.expect("lock");
    second.lock(&key).await.expect_err("held by the first client");
    assert!(first.unlock(&key, &token).await.expect("unlock"));

    first.clear().await.expect("clear");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(second.get(&key).await.expect("get"), None);
}
