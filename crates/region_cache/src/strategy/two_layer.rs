// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Two-layer region strategy: process memory in front of the generation-guarded store.
//!
//! Writes go to the store together with a broadcast in one atomic step. Other clients
//! react to the broadcast by dropping their local copy, so their next read falls through
//! to the store. Local copies never outlive the residual time-to-live of the store key
//! they were read from.

use std::slice;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use super::RegionStrategy;
use super::versioned::VersionedCore;
use crate::listener::{Listener, MessageHandler, Outgoing};
use crate::local::LocalCache;
use crate::message::{Operation, SyncMessage};
use crate::store::RegionStore;
use crate::{CacheKey, Error, LockToken, RegionConfig, Result};

#[derive(Debug)]
struct Layers<S> {
    remote: VersionedCore<S>,
    local: LocalCache,
}

impl<S: RegionStore> Layers<S> {
    fn local_keys(&self, keys: &[CacheKey]) -> Vec<String> {
        keys.iter().map(|key| self.remote.local_key(key)).collect()
    }

    async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<Bytes>>> {
        let generation = self.remote.generation();
        let local_keys = self.local_keys(keys);
        let mut values: Vec<Option<Bytes>> = local_keys.iter().map(|key| self.local.get(key, generation)).collect();

        let missing: Vec<usize> = (0..keys.len()).filter(|index| values[*index].is_none()).collect();
        if missing.is_empty() {
            return Ok(values);
        }

        let tickets: Vec<_> = missing.iter().map(|index| self.local.begin_fill(&local_keys[*index])).collect();
        let missing_keys: Vec<CacheKey> = missing.iter().map(|index| keys[*index].clone()).collect();
        let with_ttl = !self.remote.config().uses_sliding_expiration();
        let (generation, fetched) = self.remote.fetch(&missing_keys, with_ttl).await?;
        let expiration = self.remote.config().expiration();

        for ((index, ticket), slot) in missing.into_iter().zip(tickets).zip(fetched) {
            match slot {
                Some(fetched) => {
                    let ttl = fetched.ttl.map_or(expiration, |residual| residual.min(expiration));
                    self.local.complete_fill(ticket, fetched.value.clone(), generation, ttl);
                    values[index] = Some(fetched.value);
                }
                None => self.local.abandon_fill(&local_keys[index], ticket),
            }
        }
        Ok(values)
    }

    async fn put_many(&self, keys: &[CacheKey], values: &[Bytes]) -> Result<()> {
        let local_keys = self.local_keys(keys);
        let notify = self.remote.publication(Operation::Put {
            entries: local_keys.iter().map(|key| (key.clone(), None)).collect(),
        })?;

        let expires_at = Instant::now() + self.remote.config().expiration();
        match self.remote.write(keys, values, notify.as_ref()).await {
            Ok(Some(generation)) => {
                for (key, value) in local_keys.iter().zip(values) {
                    self.local.set(key, value.clone(), generation, expires_at);
                }
                Ok(())
            }
            Ok(None) => {
                self.invalidate(&local_keys);
                Ok(())
            }
            Err(error) => {
                self.invalidate(&local_keys);
                Err(error)
            }
        }
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> Result<u64> {
        let local_keys = self.local_keys(keys);
        let notify = self.remote.publication(Operation::Remove { keys: local_keys.clone() })?;
        let removed = self.remote.delete(keys, notify.as_ref()).await;
        self.invalidate(&local_keys);
        removed
    }

    async fn clear(&self) -> Result<()> {
        let cleared = self.remote.clear().await;
        self.local.flush();
        cleared.map(drop)
    }

    fn invalidate(&self, local_keys: &[String]) {
        for key in local_keys {
            self.local.invalidate(key);
        }
    }
}

impl<S: RegionStore> MessageHandler for Layers<S> {
    fn on_message(&self, message: SyncMessage) -> Vec<Outgoing> {
        match message.operation {
            Operation::Put { entries } => {
                for (key, _) in entries {
                    self.local.invalidate(&key);
                }
            }
            Operation::Remove { keys } => self.invalidate(&keys),
            Operation::Clear { version } => {
                if let Some(version) = version {
                    self.remote.adopt(version);
                }
                self.local.flush();
            }
            Operation::Lock { .. } | Operation::LockReply { .. } | Operation::Unlock { .. } => {}
        }
        Vec::new()
    }

    fn on_disrupted(&self, _reason: &str) {
        self.local.flush();
    }
}

/// Process memory in front of the generation-guarded store, kept coherent by broadcast.
///
/// Reads are served locally while the local copy was read under the current generation
/// and has not outlived its store key. Writes from this client update its local copy;
/// writes from other clients evict it.
#[derive(Debug)]
pub struct TwoLayerStrategy<S> {
    layers: Arc<Layers<S>>,
    _listener: Listener,
}

impl<S: RegionStore> TwoLayerStrategy<S> {
    /// Connects a region to the store and subscribes to its channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when expiration or broadcast is disabled, and
    /// [`Error::Store`] when the store cannot be reached.
    pub async fn new(store: Arc<S>, config: RegionConfig) -> Result<Self> {
        // Local copies are only ever evicted by broadcasts.
        if !config.uses_pubsub() {
            return Err(Error::configuration(format!(
                "region `{}`: the two-layer strategy requires pub/sub",
                config.name()
            )));
        }

        let layers = Arc::new(Layers {
            remote: VersionedCore::connect(store, config, "two-layer").await?,
            local: LocalCache::new(),
        });

        let store = layers.remote.store();
        let subscription = store.subscribe(layers.remote.channel()).await?;
        let listener = Listener::spawn(store, vec![subscription], Arc::downgrade(&layers), layers.remote.client());

        Ok(Self {
            layers,
            _listener: listener,
        })
    }

    /// Number of keys with a local slot.
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.layers.local.len()
    }
}

impl<S: RegionStore> RegionStrategy for TwoLayerStrategy<S> {
    fn config(&self) -> &RegionConfig {
        self.layers.remote.config()
    }

    fn cache_key(&self, key: &CacheKey) -> String {
        self.layers.remote.cache_key(key)
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        Ok(self.layers.get_many(slice::from_ref(key)).await?.pop().flatten())
    }

    async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<Bytes>>> {
        self.layers.get_many(keys).await
    }

    async fn put(&self, key: &CacheKey, value: Bytes) -> Result<()> {
        self.layers.put_many(slice::from_ref(key), slice::from_ref(&value)).await
    }

    async fn put_many(&self, keys: &[CacheKey], values: &[Bytes]) -> Result<()> {
        self.layers.put_many(keys, values).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.layers.remove_many(slice::from_ref(key)).await? > 0)
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> Result<u64> {
        self.layers.remove_many(keys).await
    }

    async fn lock(&self, key: &CacheKey) -> Result<LockToken> {
        self.layers.remote.lock(slice::from_ref(key)).await
    }

    async fn lock_many(&self, keys: &[CacheKey]) -> Result<LockToken> {
        self.layers.remote.lock(keys).await
    }

    async fn unlock(&self, key: &CacheKey, token: &LockToken) -> Result<bool> {
        Ok(self.layers.remote.unlock(slice::from_ref(key), token).await? > 0)
    }

    async fn unlock_many(&self, keys: &[CacheKey], token: &LockToken) -> Result<u64> {
        self.layers.remote.unlock(keys, token).await
    }

    async fn clear(&self) -> Result<()> {
        self.layers.clear().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::ClientId;
    use crate::store::{MemoryStore, StoreOp};
    use crate::strategy::versioned::DELIVERY;

    async fn region(store: &MemoryStore, config: RegionConfig) -> TwoLayerStrategy<MemoryStore> {
        TwoLayerStrategy::new(Arc::new(store.clone()), config).await.expect("valid region")
    }

    fn fetches(store: &MemoryStore) -> usize {
        store.operations().iter().filter(|op| matches!(op, StoreOp::Fetch(_))).count()
    }

    #[tokio::test]
    async fn repeated_reads_are_served_locally() {
        let store = MemoryStore::new();
        let region = region(&store, RegionConfig::new("r")).await;
        region.put(&"k".into(), Bytes::from_static(b"v")).await.expect("put");
        store.clear_operations();

        for _ in 0..3 {
            assert_eq!(region.get(&"k".into()).await.expect("get").as_deref(), Some(&b"v"[..]));
        }

        assert_eq!(fetches(&store), 0);
    }

    #[tokio::test]
    async fn peer_invalidation_falls_through_to_store() {
        let store = MemoryStore::new();
        let region = region(&store, RegionConfig::new("r")).await;
        region.put(&"k".into(), Bytes::from_static(b"v")).await.expect("put");

        let peer = SyncMessage::new(
            ClientId::new(),
            1,
            Operation::Remove {
                keys: vec![region.layers.remote.local_key(&"k".into())],
            },
        );
        store
            .publish(region.layers.remote.channel(), peer.encode().expect("encode"))
            .await
            .expect("publish");
        tokio::time::sleep(DELIVERY).await;
        store.clear_operations();

        assert_eq!(region.get(&"k".into()).await.expect("get").as_deref(), Some(&b"v"[..]));
        assert_eq!(fetches(&store), 1);
    }

    #[tokio::test]
    async fn writes_from_other_clients_evict_local_copies() {
        let store = MemoryStore::new();
        let first = region(&store, RegionConfig::new("r")).await;
        let second = region(&store, RegionConfig::new("r")).await;
        first.put(&"k".into(), Bytes::from_static(b"one")).await.expect("put");
        assert_eq!(second.get(&"k".into()).await.expect("get").as_deref(), Some(&b"one"[..]));

        first.put(&"k".into(), Bytes::from_static(b"two")).await.expect("put");
        tokio::time::sleep(DELIVERY).await;

        assert_eq!(second.get(&"k".into()).await.expect("get").as_deref(), Some(&b"two"[..]));
        assert_eq!(first.get(&"k".into()).await.expect("get").as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test]
    async fn clear_from_another_client_flushes_local_copies() {
        let store = MemoryStore::new();
        let first = region(&store, RegionConfig::new("r")).await;
        let second = region(&store, RegionConfig::new("r")).await;
        first.put(&"k".into(), Bytes::from_static(b"v")).await.expect("put");
        assert!(second.get(&"k".into()).await.expect("get").is_some());

        first.clear().await.expect("clear");
        tokio::time::sleep(DELIVERY).await;

        assert_eq!(second.local_len(), 0);
        assert_eq!(second.get(&"k".into()).await.expect("get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn local_copy_never_outlives_store_key() {
        let store = MemoryStore::new();
        let config = RegionConfig::new("r").expire_after(Duration::from_secs(60));
        let writer = region(&store, config.clone()).await;
        let reader = region(&store, config).await;
        writer.put(&"k".into(), Bytes::from_static(b"v")).await.expect("put");

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(reader.get(&"k".into()).await.expect("get").is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        store.clear_operations();
        assert_eq!(reader.get(&"k".into()).await.expect("get"), None);
        assert_eq!(fetches(&store), 1);
    }

    #[tokio::test]
    async fn disruption_flushes_local_copies() {
        let store = MemoryStore::new();
        let region = region(&store, RegionConfig::new("r")).await;
        region.put(&"k".into(), Bytes::from_static(b"v")).await.expect("put");
        assert_eq!(region.local_len(), 1);

        store.disrupt("connection reset");
        tokio::time::sleep(DELIVERY).await;

        assert_eq!(region.local_len(), 0);
    }

    #[tokio::test]
    async fn requires_broadcast() {
        let config = RegionConfig::new("r").use_pubsub(false);

        let error = TwoLayerStrategy::new(Arc::new(MemoryStore::new()), config)
            .await
            .expect_err("peer writes could never evict local copies");

        assert!(matches!(error, Error::Configuration(_)), "{error}");
    }

    #[tokio::test]
    async fn misses_leave_no_local_slot() {
        let store = MemoryStore::new();
        let region = region(&store, RegionConfig::new("r")).await;

        for index in 0..1000 {
            assert_eq!(region.get(&CacheKey::new(&index)).await.expect("get"), None);
        }

        assert_eq!(region.local_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn own_writes_expire_with_the_store_key() {
        let store = MemoryStore::new();
        let region = region(&store, RegionConfig::new("r").expire_after(Duration::from_secs(60))).await;
        region.put(&"k".into(), Bytes::from_static(b"v")).await.expect("put");

        tokio::time::advance(Duration::from_secs(60)).await;
        store.clear_operations();

        assert_eq!(region.get(&"k".into()).await.expect("get"), None);
        assert_eq!(fetches(&store), 1);
        assert_eq!(region.local_len(), 0);
    }

    #[tokio::test]
    async fn put_and_broadcast_are_one_store_call() {
        let store = MemoryStore::new();
        let region = region(&store, RegionConfig::new("r")).await;
        store.clear_operations();

        region.put(&"k".into(), Bytes::from_static(b"v")).await.expect("put");

        assert!(matches!(store.operations().as_slice(), [StoreOp::Store(_)]));
    }
}
