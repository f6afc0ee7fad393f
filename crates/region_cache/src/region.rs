// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed access to a region.

use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;

use crate::strategy::{DynRegionStrategy, RegionStrategy, build_strategy};
use crate::{CacheKey, CacheSettings, Codec, Error, LockToken, RegionStore, Result};

/// A region with typed keys and values.
///
/// Keys are any displayable, hashable value; values are encoded with the region's codec.
/// Cloning is cheap and clones share the same strategy.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use region_cache::{CacheSettings, MemoryStore, RegionFactory};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> region_cache::Result<()> {
/// let factory = RegionFactory::new(Arc::new(MemoryStore::new()), CacheSettings::default());
/// let orders = factory.region("orders").await?;
///
/// orders.put(&42, &vec!["book", "pen"]).await?;
/// let lines: Option<Vec<String>> = orders.get(&42).await?;
/// assert_eq!(lines, Some(vec!["book".to_owned(), "pen".to_owned()]));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Region {
    strategy: Arc<DynRegionStrategy<'static>>,
    codec: Codec,
}

impl Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name())
            .field("strategy", &self.strategy.config().strategy_kind())
            .field("codec", &self.codec)
            .finish()
    }
}

fn keys_of<K: Display + Hash>(keys: &[K]) -> Vec<CacheKey> {
    keys.iter().map(CacheKey::new).collect()
}

impl Region {
    /// Wraps a strategy, encoding values with the codec its configuration names.
    #[must_use]
    pub fn new(strategy: Arc<DynRegionStrategy<'static>>) -> Self {
        let codec = strategy.config().serializer();
        Self { strategy, codec }
    }

    /// Region name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.strategy.config().name()
    }

    /// The untyped strategy behind this region.
    #[must_use]
    pub fn strategy(&self) -> &Arc<DynRegionStrategy<'static>> {
        &self.strategy
    }

    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails or the stored bytes do not decode as `V`.
    pub async fn get<K: Display + Hash + ?Sized, V: DeserializeOwned>(&self, key: &K) -> Result<Option<V>> {
        match self.strategy.get(&CacheKey::new(key)).await? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Reads several values, one slot per key.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails or a stored value does not decode as `V`.
    pub async fn get_many<K: Display + Hash, V: DeserializeOwned>(&self, keys: &[K]) -> Result<Vec<Option<V>>> {
        self.strategy
            .get_many(&keys_of(keys))
            .await?
            .into_iter()
            .map(|slot| slot.map(|bytes| self.codec.decode(&bytes)).transpose())
            .collect()
    }

    /// Writes a value.
    ///
    /// # Errors
    ///
    /// Returns an error when the value cannot be encoded or the store fails.
    pub async fn put<K: Display + Hash + ?Sized, V: Serialize + ?Sized>(&self, key: &K, value: &V) -> Result<()> {
        let bytes = self.codec.encode(value)?;
        self.strategy.put(&CacheKey::new(key), bytes).await
    }

    /// Writes several values.
    ///
    /// # Errors
    ///
    /// Returns an error when a value cannot be encoded or the store fails.
    pub async fn put_many<K: Display + Hash, V: Serialize>(&self, entries: &[(K, V)]) -> Result<()> {
        let keys: Vec<CacheKey> = entries.iter().map(|(key, _)| CacheKey::new(key)).collect();
        let values = entries
            .iter()
            .map(|(_, value)| self.codec.encode(value))
            .collect::<Result<Vec<Bytes>>>()?;
        self.strategy.put_many(&keys, &values).await
    }

    /// Removes a value, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn remove<K: Display + Hash + ?Sized>(&self, key: &K) -> Result<bool> {
        self.strategy.remove(&CacheKey::new(key)).await
    }

    /// Removes several values, returning how many existed.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn remove_many<K: Display + Hash>(&self, keys: &[K]) -> Result<u64> {
        self.strategy.remove_many(&keys_of(keys)).await
    }

    /// Locks a key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockAcquisition`] when the key stays locked by another holder.
    pub async fn lock<K: Display + Hash + ?Sized>(&self, key: &K) -> Result<LockToken> {
        self.strategy.lock(&CacheKey::new(key)).await
    }

    /// Locks several keys together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockAcquisition`] when any key stays locked by another holder.
    pub async fn lock_many<K: Display + Hash>(&self, keys: &[K]) -> Result<LockToken> {
        self.strategy.lock_many(&keys_of(keys)).await
    }

    /// Releases a key, returning whether it was released.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn unlock<K: Display + Hash + ?Sized>(&self, key: &K, token: &LockToken) -> Result<bool> {
        self.strategy.unlock(&CacheKey::new(key), token).await
    }

    /// Releases several keys, returning how many were released.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn unlock_many<K: Display + Hash>(&self, keys: &[K], token: &LockToken) -> Result<u64> {
        self.strategy.unlock_many(&keys_of(keys), token).await
    }

    /// Clears the region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] for strategies that cannot clear.
    pub async fn clear(&self) -> Result<()> {
        self.strategy.clear().await
    }

    /// Returns a blocking view of this region driven by `handle`.
    #[must_use]
    pub fn blocking(&self, handle: Handle) -> BlockingRegion {
        BlockingRegion {
            region: self.clone(),
            handle,
        }
    }
}

/// Blocking counterpart of [`Region`] for synchronous callers.
///
/// Each call blocks the current thread on the given runtime. Calls must not be made from
/// within an asynchronous context.
#[derive(Clone, Debug)]
pub struct BlockingRegion {
    region: Region,
    handle: Handle,
}

impl BlockingRegion {
    /// See [`Region::get`].
    ///
    /// # Errors
    ///
    /// As [`Region::get`].
    pub fn get<K: Display + Hash + ?Sized, V: DeserializeOwned>(&self, key: &K) -> Result<Option<V>> {
        self.handle.block_on(self.region.get(key))
    }

    /// See [`Region::get_many`].
    ///
    /// # Errors
    ///
    /// As [`Region::get_many`].
    pub fn get_many<K: Display + Hash, V: DeserializeOwned>(&self, keys: &[K]) -> Result<Vec<Option<V>>> {
        self.handle.block_on(self.region.get_many(keys))
    }

    /// See [`Region::put`].
    ///
    /// # Errors
    ///
    /// As [`Region::put`].
    pub fn put<K: Display + Hash + ?Sized, V: Serialize + ?Sized>(&self, key: &K, value: &V) -> Result<()> {
        self.handle.block_on(self.region.put(key, value))
    }

    /// See [`Region::put_many`].
    ///
    /// # Errors
    ///
    /// As [`Region::put_many`].
    pub fn put_many<K: Display + Hash, V: Serialize>(&self, entries: &[(K, V)]) -> Result<()> {
        self.handle.block_on(self.region.put_many(entries))
    }

    /// See [`Region::remove`].
    ///
    /// # Errors
    ///
    /// As [`Region::remove`].
    pub fn remove<K: Display + Hash + ?Sized>(&self, key: &K) -> Result<bool> {
        self.handle.block_on(self.region.remove(key))
    }

    /// See [`Region::remove_many`].
    ///
    /// # Errors
    ///
    /// As [`Region::remove_many`].
    pub fn remove_many<K: Display + Hash>(&self, keys: &[K]) -> Result<u64> {
        self.handle.block_on(self.region.remove_many(keys))
    }

    /// See [`Region::lock`].
    ///
    /// # Errors
    ///
    /// As [`Region::lock`].
    pub fn lock<K: Display + Hash + ?Sized>(&self, key: &K) -> Result<LockToken> {
        self.handle.block_on(self.region.lock(key))
    }

    /// See [`Region::lock_many`].
    ///
    /// # Errors
    ///
    /// As [`Region::lock_many`].
    pub fn lock_many<K: Display + Hash>(&self, keys: &[K]) -> Result<LockToken> {
        self.handle.block_on(self.region.lock_many(keys))
    }

    /// See [`Region::unlock`].
    ///
    /// # Errors
    ///
    /// As [`Region::unlock`].
    pub fn unlock<K: Display + Hash + ?Sized>(&self, key: &K, token: &LockToken) -> Result<bool> {
        self.handle.block_on(self.region.unlock(key, token))
    }

    /// See [`Region::unlock_many`].
    ///
    /// # Errors
    ///
    /// As [`Region::unlock_many`].
    pub fn unlock_many<K: Display + Hash>(&self, keys: &[K], token: &LockToken) -> Result<u64> {
        self.handle.block_on(self.region.unlock_many(keys, token))
    }

    /// See [`Region::clear`].
    ///
    /// # Errors
    ///
    /// As [`Region::clear`].
    pub fn clear(&self) -> Result<()> {
        self.handle.block_on(self.region.clear())
    }
}

/// Builds regions from settings over one shared store.
///
/// Each region is built once; later requests for the same name return the same region.
pub struct RegionFactory<S> {
    store: Arc<S>,
    settings: CacheSettings,
    regions: DashMap<String, Region>,
}

impl<S> Debug for RegionFactory<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionFactory")
            .field("settings", &self.settings)
            .field("regions", &self.regions.len())
            .finish_non_exhaustive()
    }
}

impl<S: RegionStore> RegionFactory<S> {
    /// Creates a factory.
    #[must_use]
    pub fn new(store: Arc<S>, settings: CacheSettings) -> Self {
        Self {
            store,
            settings,
            regions: DashMap::new(),
        }
    }

    /// Returns the named region, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the region's settings are invalid or name a
    /// database other than the one the store is connected to, and [`Error::Store`] when
    /// the store cannot be reached.
    pub async fn region(&self, name: &str) -> Result<Region> {
        if let Some(region) = self.regions.get(name) {
            return Ok(region.clone());
        }

        let config = self.settings.region(name);
        if config.database() != self.store.database() {
            return Err(Error::configuration(format!(
                "region `{name}` uses database {} but the store is connected to database {}",
                config.database(),
                self.store.database()
            )));
        }

        let region = Region::new(build_strategy(Arc::clone(&self.store), config).await?);
        Ok(self.regions.entry(name.to_owned()).or_insert(region).clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;
    use crate::{MemoryStore, RegionConfig, RegionOverrides, StrategyKind};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    fn settings() -> CacheSettings {
        CacheSettings::default()
            .with_region(
                "foo",
                RegionOverrides {
                    expiration: Some(Duration::from_secs(500)),
                    use_sliding_expiration: Some(true),
                    ..RegionOverrides::default()
                },
            )
            .with_region(
                "binary",
                RegionOverrides {
                    serializer: Some(Codec::Binary),
                    strategy: Some(StrategyKind::TwoLayer),
                    ..RegionOverrides::default()
                },
            )
    }

    #[tokio::test]
    async fn region_settings_reach_the_strategy() {
        let factory = RegionFactory::new(Arc::new(MemoryStore::new()), settings());

        let foo = factory.region("foo").await.expect("region");

        assert_eq!(foo.strategy().config().expiration(), Duration::from_secs(500));
        assert!(foo.strategy().config().uses_sliding_expiration());
    }

    #[tokio::test]
    async fn typed_values_round_trip_with_either_codec() {
        let factory = RegionFactory::new(Arc::new(MemoryStore::new()), settings());
        let profile = Profile {
            name: "ada".to_owned(),
            visits: 3,
        };

        for name in ["json", "binary"] {
            let region = factory.region(name).await.expect("region");
            region.put(&"ada", &profile).await.expect("put");
            assert_eq!(region.get::<_, Profile>(&"ada").await.expect("get"), Some(profile.clone()));
        }
    }

    #[tokio::test]
    async fn regions_are_built_once() {
        let store = MemoryStore::new();
        let factory = RegionFactory::new(Arc::new(store.clone()), settings());

        factory.region("orders").await.expect("region");
        let before = store.operations().len();
        factory.region("orders").await.expect("region");

        assert_eq!(store.operations().len(), before);
    }

    #[tokio::test]
    async fn database_mismatch_is_rejected() {
        let factory = RegionFactory::new(
            Arc::new(MemoryStore::new().with_database(3)),
            CacheSettings::new(RegionConfig::default().database_index(1)),
        );

        let error = factory.region("orders").await.expect_err("wrong database");

        assert!(matches!(error, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn batch_operations_keep_key_order() {
        let factory = RegionFactory::new(Arc::new(MemoryStore::new()), settings());
        let region = factory.region("orders").await.expect("region");

        region.put_many(&[(1, "one"), (3, "three")]).await.expect("put");
        let values: Vec<Option<String>> = region.get_many(&[1, 2, 3]).await.expect("get");

        assert_eq!(values, vec![Some("one".to_owned()), None, Some("three".to_owned())]);
        assert_eq!(region.remove_many(&[1, 2, 3]).await.expect("remove"), 2);
    }

    #[test]
    fn blocking_region_drives_the_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("runtime");
        let factory = RegionFactory::new(Arc::new(MemoryStore::new()), settings());
        let region = runtime.block_on(factory.region("orders")).expect("region");
        let blocking = region.blocking(runtime.handle().clone());

        blocking.put(&"k", &7_u32).expect("put");
        assert_eq!(blocking.get::<_, u32>(&"k").expect("get"), Some(7));

        let token = blocking.lock(&"k").expect("lock");
        assert!(blocking.unlock(&"k", &token).expect("unlock"));
        blocking.clear().expect("clear");
        assert_eq!(blocking.get::<_, u32>(&"k").expect("get"), None);
    }
}

