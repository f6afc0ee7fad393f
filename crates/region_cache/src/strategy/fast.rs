// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Region strategy without generations.

use std::slice;
use std::sync::Arc;

use bytes::Bytes;

use super::{RegionStrategy, check_lock_batch, check_pairs, unguarded};
use crate::key::KeyCodec;
use crate::lock::DistributedLocker;
use crate::store::{FetchOptions, RegionStore};
use crate::{CacheKey, Error, LockToken, RegionConfig, Result};

/// Values in the store under plain derived keys.
///
/// Skips all generation bookkeeping, so every call is a single store round trip, at the
/// price of not supporting [`clear`](RegionStrategy::clear). A zero expiration keeps
/// values until they are removed.
#[derive(Debug)]
pub struct FastStrategy<S> {
    store: Arc<S>,
    config: RegionConfig,
    codec: KeyCodec,
    locker: DistributedLocker<S>,
}

impl<S: RegionStore> FastStrategy<S> {
    /// Creates the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the configuration is invalid.
    pub fn new(store: Arc<S>, config: RegionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            locker: DistributedLocker::new(Arc::clone(&store), config.lock()),
            codec: KeyCodec::new(&config),
            store,
            config,
        })
    }

    fn derive(&self, keys: &[CacheKey]) -> Vec<String> {
        keys.iter().map(|key| self.codec.cache_key(key, None)).collect()
    }
}

impl<S: RegionStore> RegionStrategy for FastStrategy<S> {
    fn config(&self) -> &RegionConfig {
        &self.config
    }

    fn cache_key(&self, key: &CacheKey) -> String {
        self.codec.cache_key(key, None)
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        Ok(self.get_many(slice::from_ref(key)).await?.pop().flatten())
    }

    async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let options = FetchOptions {
            sliding_ttl: if self.config.uses_sliding_expiration() { self.config.ttl() } else { None },
            with_ttl: false,
        };
        let values = unguarded(self.store.fetch(&self.derive(keys), options, None).await?)?;
        Ok(values.into_iter().map(|slot| slot.map(|fetched| fetched.value)).collect())
    }

    async fn put(&self, key: &CacheKey, value: Bytes) -> Result<()> {
        self.put_many(slice::from_ref(key), slice::from_ref(&value)).await
    }

    async fn put_many(&self, keys: &[CacheKey], values: &[Bytes]) -> Result<()> {
        check_pairs(keys, values)?;
        if keys.is_empty() {
            return Ok(());
        }
        let entries: Vec<(String, Bytes)> = self.derive(keys).into_iter().zip(values.iter().cloned()).collect();
        unguarded(self.store.store(&entries, self.config.ttl(), None, None).await?)
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.remove_many(slice::from_ref(key)).await? > 0)
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        unguarded(self.store.delete(&self.derive(keys), None, None).await?)
    }

    async fn lock(&self, key: &CacheKey) -> Result<LockToken> {
        self.lock_many(slice::from_ref(key)).await
    }

    async fn lock_many(&self, keys: &[CacheKey]) -> Result<LockToken> {
        check_lock_batch(keys)?;
        unguarded(self.locker.lock_many(&self.derive(keys), None).await?)
    }

    async fn unlock(&self, key: &CacheKey, token: &LockToken) -> Result<bool> {
        Ok(self.unlock_many(slice::from_ref(key), token).await? > 0)
    }

    async fn unlock_many(&self, keys: &[CacheKey], token: &LockToken) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        unguarded(self.locker.unlock_many(&self.derive(keys), token, None).await?)
    }

    async fn clear(&self) -> Result<()> {
        Err(Error::Unsupported {
            strategy: "fast",
            operation: "clear",
        })
    }
}
