// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The contract a backing key-value store fulfills for region strategies.
//!
//! A store offers single-key atomicity, multi-key atomic scripts guarded by a region
//! generation, and publish/subscribe broadcast. [`MemoryStore`] implements it in process;
//! the `region_cache_redis` crate implements it over Redis.

mod memory;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

pub use memory::{MemoryStore, StoreOp};

use crate::Result;

/// Outcome of a store call that was guarded by a region generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Versioned<T> {
    /// The stored generation matched; the call took effect.
    Current(T),
    /// The stored generation differed; the call had no effect.
    Stale,
}

impl<T> Versioned<T> {
    /// Returns the result of a call that took effect.
    pub fn current(self) -> Option<T> {
        match self {
            Self::Current(value) => Some(value),
            Self::Stale => None,
        }
    }

    /// Maps the result of a call that took effect.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        match self {
            Self::Current(value) => Versioned::Current(f(value)),
            Self::Stale => Versioned::Stale,
        }
    }

    /// Returns `true` when the generation had moved on.
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }
}

/// The generation a guarded call expects to find under the region's version key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionGuard {
    /// Version key of the region.
    pub key: String,
    /// Generation the caller derived its keys from.
    pub expected: u64,
}

/// A message to publish atomically with a write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publication {
    /// Channel to publish on.
    pub channel: String,
    /// Encoded message.
    pub payload: Bytes,
}

/// How a fetch treats the time-to-live of the keys it reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// When set, each key found has its time-to-live reset to this value.
    pub sliding_ttl: Option<Duration>,
    /// When set, the residual time-to-live of each key found is returned.
    pub with_ttl: bool,
}

/// A value read from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetched {
    /// The stored bytes.
    pub value: Bytes,
    /// Residual time-to-live, when requested and the key expires.
    pub ttl: Option<Duration>,
}

/// What a subscription yields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// A message published on the channel.
    Message(Bytes),
    /// The subscription was disrupted; messages may have been missed.
    Disrupted(String),
}

/// A stream of events for one channel.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    events: mpsc::UnboundedReceiver<StoreEvent>,
}

impl Subscription {
    /// Wraps the receiving half of an event channel.
    #[must_use]
    pub fn new(channel: impl Into<String>, events: mpsc::UnboundedReceiver<StoreEvent>) -> Self {
        Self {
            channel: channel.into(),
            events,
        }
    }

    /// Channel this subscription listens to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next event. Returns `None` once the store closed the subscription.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.events.recv().await
    }
}

/// A shared key-value store with generation-guarded scripts and broadcast.
///
/// Every guarded call checks, atomically with its effect, that the value under
/// `guard.key` equals `guard.expected`, and returns [`Versioned::Stale`] without any effect
/// otherwise. Calls without a guard always take effect.
///
/// Implementations are shared by every region and task of a process.
pub trait RegionStore: Send + Sync + 'static {
    /// Reads `keys`, returning one slot per key in order.
    fn fetch(
        &self,
        keys: &[String],
        options: FetchOptions,
        guard: Option<&VersionGuard>,
    ) -> impl Future<Output = Result<Versioned<Vec<Option<Fetched>>>>> + Send;

    /// Writes every entry with `ttl` (or without expiry) and publishes `notify` in the same
    /// atomic step.
    fn store(
        &self,
        entries: &[(String, Bytes)],
        ttl: Option<Duration>,
        guard: Option<&VersionGuard>,
        notify: Option<&Publication>,
    ) -> impl Future<Output = Result<Versioned<()>>> + Send;

    /// Deletes `keys` and publishes `notify` in the same atomic step, returning how many
    /// keys existed.
    fn delete(
        &self,
        keys: &[String],
        guard: Option<&VersionGuard>,
        notify: Option<&Publication>,
    ) -> impl Future<Output = Result<Versioned<u64>>> + Send;

    /// Sets every key to `token` with `ttl` only if none of them exists.
    ///
    /// Returns `false` and sets nothing when any key is already present.
    fn lock(
        &self,
        keys: &[String],
        token: &str,
        ttl: Duration,
        guard: Option<&VersionGuard>,
    ) -> impl Future<Output = Result<Versioned<bool>>> + Send;

    /// Deletes the keys whose value equals `token`, returning how many were deleted.
    fn unlock(&self, keys: &[String], token: &str, guard: Option<&VersionGuard>) -> impl Future<Output = Result<Versioned<u64>>> + Send;

    /// Reads the generation stored under `key`, initializing it to 1 when absent.
    fn read_version(&self, key: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Increments the generation stored under `key`, wrapping to 1 above `max`.
    fn bump_version(&self, key: &str, max: u64) -> impl Future<Output = Result<u64>> + Send;

    /// Publishes `payload`, returning how many subscribers received it.
    fn publish(&self, channel: &str, payload: Bytes) -> impl Future<Output = Result<u64>> + Send;

    /// Subscribes to `channel`.
    fn subscribe(&self, channel: &str) -> impl Future<Output = Result<Subscription>> + Send;

    /// Whether [`RegionStore::lock`] is atomic across several keys.
    fn supports_batch_scripts(&self) -> bool {
        true
    }

    /// Logical database this store is connected to.
    fn database(&self) -> u32 {
        0
    }
}
