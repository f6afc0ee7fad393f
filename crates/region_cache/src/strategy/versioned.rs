// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generation-guarded region strategy.
//!
//! Every derived key embeds the region generation, and every store call carries a guard
//! the store checks atomically with the call. Clearing the region increments the
//! generation, which orphans every key derived from the previous one in constant time;
//! orphaned keys age out through their time-to-live.

use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::time::Instant;

use super::{RegionStrategy, check_lock_batch, check_pairs};
use crate::key::KeyCodec;
use crate::listener::{Listener, MessageHandler, Outgoing};
use crate::lock::DistributedLocker;
use crate::message::{ClientId, LogicalClock, Operation, SyncMessage};
use crate::store::{FetchOptions, Fetched, Publication, RegionStore, VersionGuard, Versioned};
use crate::{CacheKey, Error, LockToken, RegionConfig, Result};

/// State shared by the strategies that keep values in the store under a generation.
#[derive(Debug)]
pub(crate) struct VersionedCore<S> {
    store: Arc<S>,
    config: RegionConfig,
    codec: KeyCodec,
    version_key: String,
    channel: String,
    generation: AtomicU64,
    locker: DistributedLocker<S>,
    client: ClientId,
    clock: LogicalClock,
    strategy: &'static str,
}

impl<S: RegionStore> VersionedCore<S> {
    pub async fn connect(store: Arc<S>, config: RegionConfig, strategy: &'static str) -> Result<Self> {
        if config.ttl().is_none() {
            return Err(Error::configuration(format!(
                "region `{}`: the {strategy} strategy requires a non-zero expiration",
                config.name()
            )));
        }

        let codec = KeyCodec::new(&config);
        let version_key = codec.version_key();
        let generation = store.read_version(&version_key).await?;
        tracing::event!(
            name: "region_cache.generation.adopted",
            tracing::Level::INFO,
            cache.region = config.name(),
            cache.generation = generation,
            "adopted region generation"
        );

        Ok(Self {
            locker: DistributedLocker::new(Arc::clone(&store), config.lock()),
            channel: codec.channel(),
            store,
            codec,
            version_key,
            generation: AtomicU64::new(generation),
            client: ClientId::new(),
            clock: LogicalClock::default(),
            strategy,
            config,
        })
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Key of `key` in this process's local layer, independent of the generation.
    pub fn local_key(&self, key: &CacheKey) -> String {
        self.codec.cache_key(key, None)
    }

    pub fn cache_key(&self, key: &CacheKey) -> String {
        self.codec.cache_key(key, Some(self.generation()))
    }

    /// Adopts a generation learned from the store or from another client.
    pub fn adopt(&self, generation: u64) {
        let previous = self.generation.swap(generation, Ordering::AcqRel);
        if previous != generation {
            tracing::event!(
                name: "region_cache.generation.adopted",
                tracing::Level::INFO,
                cache.region = self.config.name(),
                cache.generation = generation,
                "adopted region generation"
            );
        }
    }

    async fn refresh(&self) -> Result<u64> {
        let generation = self.store.read_version(&self.version_key).await?;
        self.adopt(generation);
        Ok(generation)
    }

    fn guard(&self, expected: u64) -> VersionGuard {
        VersionGuard {
            key: self.version_key.clone(),
            expected,
        }
    }

    fn derive(&self, keys: &[CacheKey], generation: u64) -> Vec<String> {
        keys.iter().map(|key| self.codec.cache_key(key, Some(generation))).collect()
    }

    fn stale(&self, operation: &'static str, generation: u64) {
        tracing::event!(
            name: "region_cache.generation.stale",
            tracing::Level::DEBUG,
            cache.region = self.config.name(),
            cache.generation = generation,
            cache.operation = operation,
            "region generation changed underneath the operation"
        );
    }

    /// Builds the broadcast that accompanies a write, when broadcasting is enabled.
    pub fn publication(&self, operation: Operation) -> Result<Option<Publication>> {
        if !self.config.uses_pubsub() {
            return Ok(None);
        }
        let payload = SyncMessage::new(self.client, self.clock.tick(), operation).encode()?;
        Ok(Some(Publication {
            channel: self.channel.clone(),
            payload,
        }))
    }

    /// Reads `keys`, retrying under a refreshed generation when the generation moved.
    ///
    /// Returns the generation the values were read under. Once the retries are spent the
    /// read misses.
    pub async fn fetch(&self, keys: &[CacheKey], with_ttl: bool) -> Result<(u64, Vec<Option<Fetched>>)> {
        let options = FetchOptions {
            sliding_ttl: if self.config.uses_sliding_expiration() { self.config.ttl() } else { None },
            with_ttl,
        };

        let mut retries = 0;
        let mut generation = self.generation();
        loop {
            let derived = self.derive(keys, generation);
            match self.store.fetch(&derived, options, Some(&self.guard(generation))).await? {
                Versioned::Current(values) => return Ok((generation, values)),
                Versioned::Stale => {
                    self.stale("get", generation);
                    generation = self.refresh().await?;
                    if retries >= self.config.stale_read_retries() {
                        return Ok((generation, vec![None; keys.len()]));
                    }
                    retries += 1;
                }
            }
        }
    }

    /// Writes values under the current generation.
    ///
    /// Returns the generation written under, or `None` when the write was abandoned
    /// because the generation moved.
    pub async fn write(&self, keys: &[CacheKey], values: &[Bytes], notify: Option<&Publication>) -> Result<Option<u64>> {
        check_pairs(keys, values)?;
        if keys.is_empty() {
            return Ok(Some(self.generation()));
        }

        let generation = self.generation();
        let entries: Vec<(String, Bytes)> = self.derive(keys, generation).into_iter().zip(values.iter().cloned()).collect();
        match self.store.store(&entries, self.config.ttl(), Some(&self.guard(generation)), notify).await? {
            Versioned::Current(()) => Ok(Some(generation)),
            Versioned::Stale => {
                self.stale("put", generation);
                self.refresh().await?;
                Ok(None)
            }
        }
    }

    /// Deletes values under the current generation, returning how many existed.
    pub async fn delete(&self, keys: &[CacheKey], notify: Option<&Publication>) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let generation = self.generation();
        let derived = self.derive(keys, generation);
        match self.store.delete(&derived, Some(&self.guard(generation)), notify).await? {
            Versioned::Current(removed) => Ok(removed),
            Versioned::Stale => {
                self.stale("remove", generation);
                self.refresh().await?;
                Ok(0)
            }
        }
    }

    pub async fn lock(&self, keys: &[CacheKey]) -> Result<LockToken> {
        check_lock_batch(keys)?;
        if keys.len() > 1 && !self.store.supports_batch_scripts() {
            return Err(Error::Unsupported {
                strategy: self.strategy,
                operation: "lock_many",
            });
        }

        let started = Instant::now();
        let mut retries = 0;
        let mut generation = self.generation();
        loop {
            let derived = self.derive(keys, generation);
            match self.locker.lock_many(&derived, Some(&self.guard(generation))).await? {
                Versioned::Current(token) => return Ok(token),
                Versioned::Stale => {
                    self.stale("lock", generation);
                    generation = self.refresh().await?;
                    if retries >= self.config.stale_read_retries() {
                        return Err(Error::LockAcquisition {
                            keys: keys.len(),
                            attempts: retries + 1,
                            elapsed: started.elapsed(),
                        });
                    }
                    retries += 1;
                }
            }
        }
    }

    pub async fn unlock(&self, keys: &[CacheKey], token: &LockToken) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let generation = self.generation();
        let derived = self.derive(keys, generation);
        match self.locker.unlock_many(&derived, token, Some(&self.guard(generation))).await? {
            Versioned::Current(released) => Ok(released),
            Versioned::Stale => {
                self.stale("unlock", generation);
                self.refresh().await?;
                Ok(0)
            }
        }
    }

    /// Moves the region to its next generation and tells the other clients.
    pub async fn clear(&self) -> Result<u64> {
        let generation = self.store.bump_version(&self.version_key, self.config.max_allowed_version()).await?;
        self.adopt(generation);
        tracing::event!(
            name: "region_cache.region.cleared",
            tracing::Level::INFO,
            cache.region = self.config.name(),
            cache.generation = generation,
            "cleared region"
        );

        // Peers that miss the notification find the new generation through stale guards.
        if let Some(publication) = self.publication(Operation::Clear { version: Some(generation) })?
            && let Err(error) = self.store.publish(&publication.channel, publication.payload).await
        {
            tracing::event!(
                name: "region_cache.region.clear_not_broadcast",
                tracing::Level::WARN,
                cache.region = self.config.name(),
                cache.generation = generation,
                error = %error,
                "failed to broadcast clear"
            );
        }
        Ok(generation)
    }
}

impl<S: RegionStore> MessageHandler for VersionedCore<S> {
    fn on_message(&self, message: SyncMessage) -> Vec<Outgoing> {
        if let Operation::Clear { version: Some(version) } = message.operation {
            self.adopt(version);
        }
        Vec::new()
    }

    fn on_disrupted(&self, _reason: &str) {}
}

/// The default strategy: values in the store, cleared by moving to a new generation.
///
/// Writes that race with a clear are abandoned rather than landing in the new generation,
/// and reads that race with a clear retry under the new generation before missing.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use region_cache::{MemoryStore, RegionConfig, RegionStrategy, VersionedStrategy};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> region_cache::Result<()> {
/// let region = VersionedStrategy::new(Arc::new(MemoryStore::new()), RegionConfig::new("orders")).await?;
///
/// region.put(&"42".into(), "pending".into()).await?;
/// region.clear().await?;
/// assert_eq!(region.get(&"42".into()).await?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct VersionedStrategy<S> {
    core: Arc<VersionedCore<S>>,
    _listener: Option<Listener>,
}

impl<S: RegionStore> VersionedStrategy<S> {
    /// Connects a region to the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when expiration is disabled, and [`Error::Store`]
    /// when the generation cannot be read or the region channel cannot be subscribed to.
    pub async fn new(store: Arc<S>, config: RegionConfig) -> Result<Self> {
        let core = Arc::new(VersionedCore::connect(store, config, "default").await?);
        let listener = if core.config().uses_pubsub() {
            let subscription = core.store().subscribe(core.channel()).await?;
            Some(Listener::spawn(core.store(), vec![subscription], Arc::downgrade(&core), core.client()))
        } else {
            None
        };

        Ok(Self {
            core,
            _listener: listener,
        })
    }

    /// The generation this client currently derives keys from.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.core.generation()
    }
}

impl<S: RegionStore> RegionStrategy for VersionedStrategy<S> {
    fn config(&self) -> &RegionConfig {
        self.core.config()
    }

    fn cache_key(&self, key: &CacheKey) -> String {
        self.core.cache_key(key)
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let (_, mut values) = self.core.fetch(slice::from_ref(key), false).await?;
        Ok(values.pop().flatten().map(|fetched| fetched.value))
    }

    async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (_, values) = self.core.fetch(keys, false).await?;
        Ok(values.into_iter().map(|slot| slot.map(|fetched| fetched.value)).collect())
    }

    async fn put(&self, key: &CacheKey, value: Bytes) -> Result<()> {
        self.core.write(slice::from_ref(key), slice::from_ref(&value), None).await.map(drop)
    }

    async fn put_many(&self, keys: &[CacheKey], values: &[Bytes]) -> Result<()> {
        self.core.write(keys, values, None).await.map(drop)
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.core.delete(slice::from_ref(key), None).await? > 0)
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> Result<u64> {
        self.core.delete(keys, None).await
    }

    async fn lock(&self, key: &CacheKey) -> Result<LockToken> {
        self.core.lock(slice::from_ref(key)).await
    }

    async fn lock_many(&self, keys: &[CacheKey]) -> Result<LockToken> {
        self.core.lock(keys).await
    }

    async fn unlock(&self, key: &CacheKey, token: &LockToken) -> Result<bool> {
        Ok(self.core.unlock(slice::from_ref(key), token).await? > 0)
    }

    async fn unlock_many(&self, keys: &[CacheKey], token: &LockToken) -> Result<u64> {
        self.core.unlock(keys, token).await
    }

    async fn clear(&self) -> Result<()> {
        self.core.clear().await.map(drop)
    }
}

/// Time a test waits for broadcast delivery between in-process clients.
#[cfg(test)]
pub(crate) const DELIVERY: std::time::Duration = std::time::Duration::from_millis(50);
