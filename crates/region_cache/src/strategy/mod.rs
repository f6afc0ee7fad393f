// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Region strategies: the ways a region keeps its clients coherent.
//!
//! | Kind | Type | Values live in | `clear` |
//! |---|---|---|---|
//! | `default` | [`VersionedStrategy`] | the store | generation bump |
//! | `fast` | [`FastStrategy`] | the store | unsupported |
//! | `two-layer` | [`TwoLayerStrategy`] | process memory and the store | generation bump plus local flush |
//! | `distributed-local` | [`ReplicatedStrategy`] | process memory, replicated by broadcast | broadcast |

mod fast;
mod replicated;
mod two_layer;
mod versioned;

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;

pub use fast::FastStrategy;
pub use replicated::ReplicatedStrategy;
pub use two_layer::TwoLayerStrategy;
pub use versioned::VersionedStrategy;

use crate::store::{RegionStore, Versioned};
use crate::{CacheKey, Error, LockToken, RegionConfig, Result};

/// The operations every region supports, whatever keeps it coherent.
///
/// Batch operations preserve the order of their keys. A value written with `put` is read
/// back by `get` until it expires, is removed, or the region is cleared.
#[dynosaur::dynosaur(pub DynRegionStrategy = dyn(box) RegionStrategy, bridge(none))]
pub trait RegionStrategy: Send + Sync {
    /// Configuration of the region.
    fn config(&self) -> &RegionConfig;

    /// Storage key currently derived for `key`.
    fn cache_key(&self, key: &CacheKey) -> String;

    /// Reads one value.
    fn get(&self, key: &CacheKey) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    /// Reads several values, one slot per key.
    fn get_many(&self, keys: &[CacheKey]) -> impl Future<Output = Result<Vec<Option<Bytes>>>> + Send;

    /// Writes one value.
    fn put(&self, key: &CacheKey, value: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Writes several values; `keys` and `values` pair up by position.
    fn put_many(&self, keys: &[CacheKey], values: &[Bytes]) -> impl Future<Output = Result<()>> + Send;

    /// Removes one value, returning whether it existed.
    fn remove(&self, key: &CacheKey) -> impl Future<Output = Result<bool>> + Send;

    /// Removes several values, returning how many existed.
    fn remove_many(&self, keys: &[CacheKey]) -> impl Future<Output = Result<u64>> + Send;

    /// Locks one key, waiting within the lock retry budget.
    fn lock(&self, key: &CacheKey) -> impl Future<Output = Result<LockToken>> + Send;

    /// Locks several keys together: either all of them or none.
    fn lock_many(&self, keys: &[CacheKey]) -> impl Future<Output = Result<LockToken>> + Send;

    /// Releases one key locked with `token`, returning whether it was released.
    fn unlock(&self, key: &CacheKey, token: &LockToken) -> impl Future<Output = Result<bool>> + Send;

    /// Releases several keys locked with `token`, returning how many were released.
    fn unlock_many(&self, keys: &[CacheKey], token: &LockToken) -> impl Future<Output = Result<u64>> + Send;

    /// Makes every value of the region unreachable.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Names the strategy a region uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Generation-guarded values in the store.
    #[default]
    Default,
    /// Values in the store without generations; cannot clear.
    Fast,
    /// A local layer in front of the generation-guarded store.
    TwoLayer,
    /// Values replicated between the clients' memories.
    DistributedLocal,
}

impl StrategyKind {
    /// Configuration name of the strategy.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Fast => "fast",
            Self::TwoLayer => "two-layer",
            Self::DistributedLocal => "distributed-local",
        }
    }
}

impl Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        [Self::Default, Self::Fast, Self::TwoLayer, Self::DistributedLocal]
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::configuration(format!("unknown region strategy `{name}`")))
    }
}

impl fmt::Debug for DynRegionStrategy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynRegionStrategy").field("config", self.config()).finish_non_exhaustive()
    }
}

/// Builds the strategy named by `config` over a shared store.
///
/// # Errors
///
/// Returns [`Error::Configuration`] when the configuration is invalid or unusable with the
/// selected strategy, and [`Error::Store`] when the store cannot be reached while the
/// strategy initializes.
pub async fn build_strategy<S: RegionStore>(store: Arc<S>, config: RegionConfig) -> Result<Arc<DynRegionStrategy<'static>>> {
    config.validate()?;
    tracing::event!(
        name: "region_cache.strategy.build",
        tracing::Level::DEBUG,
        cache.region = config.name(),
        cache.strategy = config.strategy_kind().name(),
        "building region strategy"
    );

    Ok(match config.strategy_kind() {
        StrategyKind::Default => DynRegionStrategy::new_arc(VersionedStrategy::new(store, config).await?),
        StrategyKind::Fast => DynRegionStrategy::new_arc(FastStrategy::new(store, config)?),
        StrategyKind::TwoLayer => DynRegionStrategy::new_arc(TwoLayerStrategy::new(store, config).await?),
        StrategyKind::DistributedLocal => DynRegionStrategy::new_arc(ReplicatedStrategy::new(store, config).await?),
    })
}

fn check_pairs(keys: &[CacheKey], values: &[Bytes]) -> Result<()> {
    if keys.len() == values.len() {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "{} key(s) were given with {} value(s)",
            keys.len(),
            values.len()
        )))
    }
}

fn check_lock_batch(keys: &[CacheKey]) -> Result<()> {
    if keys.is_empty() {
        Err(Error::invalid_argument("cannot lock an empty set of keys"))
    } else {
        Ok(())
    }
}

fn unguarded<T>(outcome: Versioned<T>) -> Result<T> {
    outcome
        .current()
        .ok_or_else(|| Error::store("store reported a stale generation for an unguarded call"))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("default", StrategyKind::Default)]
    #[case("fast", StrategyKind::Fast)]
    #[case("two-layer", StrategyKind::TwoLayer)]
    #[case("Distributed-Local", StrategyKind::DistributedLocal)]
    fn parses_strategy_names(#[case] name: &str, #[case] expected: StrategyKind) {
        assert_eq!(name.parse::<StrategyKind>().expect("known name"), expected);
    }

    #[test]
    fn unknown_strategy_is_a_configuration_error() {
        let error = "sql".parse::<StrategyKind>().expect_err("unknown");
        assert!(matches!(error, Error::Configuration(_)));
    }

    #[test]
    fn mismatched_batches_are_rejected() {
        let keys = [CacheKey::new("a"), CacheKey::new("b")];
        let values = [Bytes::from_static(b"1")];

        assert!(matches!(check_pairs(&keys, &values), Err(Error::InvalidArgument(_))));
        assert!(matches!(check_lock_batch(&[]), Err(Error::InvalidArgument(_))));
    }
}
