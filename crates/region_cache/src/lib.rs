// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Region-scoped distributed caches kept coherent across processes.
//!
//! A region is a named namespace of keys inside a shared key-value store. Every process
//! that opens the same region sees the same values, and the crate keeps them coherent
//! using one of several strategies:
//!
//! - [`VersionedStrategy`]: values live under generation-tagged keys, so bumping the
//!   region's generation clears it in one step.
//! - [`FastStrategy`]: plain keys and single round trips, without clearing.
//! - [`TwoLayerStrategy`]: a versioned region fronted by a process-local layer that is
//!   invalidated by notifications from other processes.
//! - [`ReplicatedStrategy`]: every process holds a full replica and changes are applied
//!   last-writer-wins.
//!
//! All strategies offer the same operations through [`RegionStrategy`]: reads, writes,
//! removals, locks over one or many keys, and clearing. [`Region`] layers typed keys and
//! values on top, and [`RegionFactory`] builds regions from [`CacheSettings`].
//!
//! The store is abstracted by [`RegionStore`]. [`MemoryStore`] implements it in process
//! and records every call, which makes it suitable for tests. The `region_cache_redis`
//! crate implements it over Redis.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use region_cache::{CacheSettings, MemoryStore, RegionFactory, RegionOverrides};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> region_cache::Result<()> {
//! let settings = CacheSettings::default().with_region(
//!     "sessions",
//!     RegionOverrides {
//!         expiration: Some(Duration::from_secs(500)),
//!         use_sliding_expiration: Some(true),
//!         ..RegionOverrides::default()
//!     },
//! );
//! let factory = RegionFactory::new(Arc::new(MemoryStore::new()), settings);
//! let sessions = factory.region("sessions").await?;
//!
//! let token = sessions.lock(&"user-7").await?;
//! sessions.put(&"user-7", &"signed-in").await?;
//! sessions.unlock(&"user-7", &token).await?;
//!
//! sessions.clear().await?;
//! assert_eq!(sessions.get::<_, String>(&"user-7").await?, None);
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! The crate emits [`tracing`] events named `region_cache.*` for lock contention, retries,
//! generation changes, and lost notification subscriptions.

mod codec;
mod config;
mod error;
mod key;
mod listener;
mod local;
mod lock;
mod message;
mod region;
mod retry;
mod store;
mod strategy;

pub use codec::Codec;
pub use config::{CacheSettings, LockConfig, RegionConfig, RegionOverrides};
pub use error::{Error, Result};
pub use key::{CacheKey, KeyCodec};
pub use lock::LockToken;
pub use message::{ClientId, Operation, Stamp, SyncMessage};
pub use region::{BlockingRegion, Region, RegionFactory};
pub use retry::{Exhausted, JitteredDelay, RetryDelay, RetryPolicy};
pub use store::{
    FetchOptions, Fetched, MemoryStore, Publication, RegionStore, StoreEvent, StoreOp, Subscription, VersionGuard, Versioned,
};
pub use strategy::{
    DynRegionStrategy, FastStrategy, RegionStrategy, ReplicatedStrategy, StrategyKind, TwoLayerStrategy, VersionedStrategy,
    build_strategy,
};
