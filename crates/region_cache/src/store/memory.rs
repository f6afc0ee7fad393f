// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process store implementation.
//!
//! [`MemoryStore`] honors the full [`RegionStore`] contract inside one process: guarded
//! scripts, time-to-live on tokio time and broadcast to local subscribers. It records every
//! operation and supports failure injection for testing error paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{FetchOptions, Fetched, Publication, RegionStore, StoreEvent, Subscription, VersionGuard, Versioned};
use crate::{Error, Result};

/// Recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Keys were fetched.
    Fetch(Vec<String>),
    /// Keys were written.
    Store(Vec<String>),
    /// Keys were deleted.
    Delete(Vec<String>),
    /// Keys were locked.
    Lock(Vec<String>),
    /// Keys were unlocked.
    Unlock(Vec<String>),
    /// A generation was read.
    ReadVersion(String),
    /// A generation was incremented.
    BumpVersion(String),
    /// A message was published on a channel.
    Publish(String),
    /// A channel was subscribed to.
    Subscribe(String),
}

type FailPredicate = Box<dyn Fn(&StoreOp) -> bool + Send + Sync>;

#[derive(Debug)]
struct Slot {
    value: Bytes,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    data: HashMap<String, Slot>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<StoreEvent>>>,
}

impl State {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Slot> {
        if self.data.get(key).is_some_and(|slot| slot.expires_at.is_some_and(|at| at <= now)) {
            self.data.remove(key);
        }
        self.data.get_mut(key)
    }

    fn guard_holds(&mut self, guard: Option<&VersionGuard>, now: Instant) -> bool {
        let Some(guard) = guard else {
            return true;
        };
        self.live(&guard.key, now)
            .and_then(|slot| parse_version(&slot.value))
            .is_some_and(|version| version == guard.expected)
    }

    fn publish(&mut self, publication: &Publication) -> u64 {
        let Some(senders) = self.subscribers.get_mut(&publication.channel) else {
            return 0;
        };
        senders.retain(|sender| sender.send(StoreEvent::Message(publication.payload.clone())).is_ok());
        senders.len() as u64
    }
}

fn parse_version(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.parse().ok()
}

/// A [`RegionStore`] held in process memory.
///
/// Clones share the same data, so several strategies built over clones of one store behave
/// like several clients of one shared server.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use region_cache::{MemoryStore, RegionConfig, RegionStrategy, build_strategy};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> region_cache::Result<()> {
/// let store = MemoryStore::new();
/// let region = build_strategy(Arc::new(store.clone()), RegionConfig::new("orders")).await?;
///
/// region.put(&"42".into(), "pending".into()).await?;
/// assert_eq!(region.get(&"42".into()).await?.as_deref(), Some(&b"pending"[..]));
/// # Ok(())
/// # }
/// ```
///
/// # Failure Injection
///
/// ```
/// use region_cache::{MemoryStore, RegionStore, StoreOp};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store.fail_when(|op| matches!(op, StoreOp::BumpVersion(_)));
///
/// assert!(store.bump_version("version", 10).await.is_err());
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    fail_when: Arc<Mutex<Option<FailPredicate>>>,
    batch_scripts: Arc<AtomicBool>,
    database: u32,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("state", &self.state)
            .field("operations", &self.operations)
            .field("fail_when", &self.fail_when.lock().is_some())
            .field("batch_scripts", &self.batch_scripts)
            .field("database", &self.database)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            operations: Arc::new(Mutex::new(Vec::new())),
            fail_when: Arc::new(Mutex::new(None)),
            batch_scripts: Arc::new(AtomicBool::new(true)),
            database: 0,
        }
    }

    /// Reports `database` as the connected logical database.
    #[must_use]
    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    /// Enables or disables atomic multi-key locking.
    ///
    /// While disabled, a multi-key [`RegionStore::lock`] fails.
    pub fn set_batch_scripts(&self, enabled: bool) {
        self.batch_scripts.store(enabled, Ordering::Relaxed);
    }

    /// Sets a predicate that determines when operations should fail.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Clears the failure predicate, allowing all operations to succeed.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    /// Returns a clone of all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().clone()
    }

    /// Clears all recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().clear();
    }

    /// Sends a disruption notice to every subscriber.
    pub fn disrupt(&self, reason: &str) {
        let mut state = self.state.lock();
        for senders in state.subscribers.values_mut() {
            senders.retain(|sender| sender.send(StoreEvent::Disrupted(reason.to_owned())).is_ok());
        }
    }

    /// Returns the live value stored under `key`.
    #[must_use]
    pub fn raw_get(&self, key: &str) -> Option<Bytes> {
        self.state.lock().live(key, Instant::now()).map(|slot| slot.value.clone())
    }

    /// Returns the residual time-to-live of `key`, if it exists and expires.
    #[must_use]
    pub fn raw_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .live(key, now)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Writes `value` under `key` without any guard, as another client would.
    pub fn raw_set(&self, key: impl Into<String>, value: impl Into<Bytes>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state.lock().data.insert(
            key.into(),
            Slot {
                value: value.into(),
                expires_at,
            },
        );
    }

    /// Returns the keys currently stored, expired ones excluded.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut keys: Vec<_> = state
            .data
            .iter()
            .filter(|(_, slot)| slot.expires_at.is_none_or(|at| at > now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    fn begin(&self, op: StoreOp) -> Result<()> {
        let fail = self.fail_when.lock().as_ref().is_some_and(|predicate| predicate(&op));
        let described = format!("{op:?}");
        self.operations.lock().push(op);
        if fail {
            return Err(Error::store(format!("memory store: injected failure for {described}")));
        }
        Ok(())
    }
}

impl RegionStore for MemoryStore {
    async fn fetch(&self, keys: &[String], options: FetchOptions, guard: Option<&VersionGuard>) -> Result<Versioned<Vec<Option<Fetched>>>> {
        self.begin(StoreOp::Fetch(keys.to_vec()))?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.guard_holds(guard, now) {
            return Ok(Versioned::Stale);
        }

        let values = keys
            .iter()
            .map(|key| {
                state.live(key, now).map(|slot| {
                    if let Some(ttl) = options.sliding_ttl {
                        slot.expires_at = Some(now + ttl);
                    }
                    Fetched {
                        value: slot.value.clone(),
                        ttl: options
                            .with_ttl
                            .then_some(slot.expires_at)
                            .flatten()
                            .map(|at| at.saturating_duration_since(now)),
                    }
                })
            })
            .collect();
        Ok(Versioned::Current(values))
    }

    async fn store(
        &self,
        entries: &[(String, Bytes)],
        ttl: Option<Duration>,
        guard: Option<&VersionGuard>,
        notify: Option<&Publication>,
    ) -> Result<Versioned<()>> {
        self.begin(StoreOp::Store(entries.iter().map(|(key, _)| key.clone()).collect()))?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.guard_holds(guard, now) {
            return Ok(Versioned::Stale);
        }

        let expires_at = ttl.map(|ttl| now + ttl);
        for (key, value) in entries {
            state.data.insert(
                key.clone(),
                Slot {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        if let Some(publication) = notify {
            state.publish(publication);
        }
        Ok(Versioned::Current(()))
    }

    async fn delete(&self, keys: &[String], guard: Option<&VersionGuard>, notify: Option<&Publication>) -> Result<Versioned<u64>> {
        self.begin(StoreOp::Delete(keys.to_vec()))?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.guard_holds(guard, now) {
            return Ok(Versioned::Stale);
        }

        let mut removed = 0;
        for key in keys {
            if state.live(key, now).is_some() {
                state.data.remove(key);
                removed += 1;
            }
        }
        if let Some(publication) = notify {
            state.publish(publication);
        }
        Ok(Versioned::Current(removed))
    }

    async fn lock(&self, keys: &[String], token: &str, ttl: Duration, guard: Option<&VersionGuard>) -> Result<Versioned<bool>> {
        self.begin(StoreOp::Lock(keys.to_vec()))?;
        if keys.len() > 1 && !self.supports_batch_scripts() {
            return Err(Error::store("memory store: multi-key scripts are disabled"));
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.guard_holds(guard, now) {
            return Ok(Versioned::Stale);
        }
        if keys.iter().any(|key| state.live(key, now).is_some()) {
            return Ok(Versioned::Current(false));
        }

        let token = Bytes::copy_from_slice(token.as_bytes());
        for key in keys {
            state.data.insert(
                key.clone(),
                Slot {
                    value: token.clone(),
                    expires_at: Some(now + ttl),
                },
            );
        }
        Ok(Versioned::Current(true))
    }

    async fn unlock(&self, keys: &[String], token: &str, guard: Option<&VersionGuard>) -> Result<Versioned<u64>> {
        self.begin(StoreOp::Unlock(keys.to_vec()))?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.guard_holds(guard, now) {
            return Ok(Versioned::Stale);
        }

        let mut released = 0;
        for key in keys {
            if state.live(key, now).is_some_and(|slot| slot.value == token.as_bytes()) {
                state.data.remove(key);
                released += 1;
            }
        }
        Ok(Versioned::Current(released))
    }

    async fn read_version(&self, key: &str) -> Result<u64> {
        self.begin(StoreOp::ReadVersion(key.to_owned()))?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(version) = state.live(key, now).and_then(|slot| parse_version(&slot.value)) {
            return Ok(version);
        }
        state.data.insert(
            key.to_owned(),
            Slot {
                value: Bytes::from_static(b"1"),
                expires_at: None,
            },
        );
        Ok(1)
    }

    async fn bump_version(&self, key: &str, max: u64) -> Result<u64> {
        self.begin(StoreOp::BumpVersion(key.to_owned()))?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let current = match state.live(key, now) {
            Some(slot) => parse_version(&slot.value).ok_or_else(|| Error::store(format!("memory store: `{key}` does not hold a generation")))?,
            None => 1,
        };
        let next = match current.checked_add(1) {
            Some(next) if next <= max => next,
            _ => 1,
        };
        state.data.insert(
            key.to_owned(),
            Slot {
                value: Bytes::from(next.to_string()),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64> {
        self.begin(StoreOp::Publish(channel.to_owned()))?;
        let publication = Publication {
            channel: channel.to_owned(),
            payload,
        };
        Ok(self.state.lock().publish(&publication))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.begin(StoreOp::Subscribe(channel.to_owned()))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.lock().subscribers.entry(channel.to_owned()).or_default().push(sender);
        Ok(Subscription::new(channel, receiver))
    }

    fn supports_batch_scripts(&self) -> bool {
        self.batch_scripts.load(Ordering::Relaxed)
    }

    fn database(&self) -> u32 {
        self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    fn guard(expected: u64) -> VersionGuard {
        VersionGuard {
            key: "v".to_owned(),
            expected,
        }
    }

    #[tokio::test]
    async fn guarded_calls_go_stale_on_generation_mismatch() {
        let store = MemoryStore::new();
        assert_eq!(store.read_version("v").await.expect("read"), 1);

        let stored = store
            .store(&[("k".to_owned(), Bytes::from_static(b"x"))], None, Some(&guard(2)), None)
            .await
            .expect("store");
        assert!(stored.is_stale());
        assert_eq!(store.raw_get("k"), None);

        let stored = store
            .store(&[("k".to_owned(), Bytes::from_static(b"x"))], None, Some(&guard(1)), None)
            .await
            .expect("store");
        assert_eq!(stored, Versioned::Current(()));
        assert_eq!(store.raw_get("k").as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn bump_version_wraps_above_max() {
        let store = MemoryStore::new();

        assert_eq!(store.bump_version("v", 3).await.expect("bump"), 2);
        assert_eq!(store.bump_version("v", 3).await.expect("bump"), 3);
        assert_eq!(store.bump_version("v", 3).await.expect("bump"), 1);
        assert_eq!(store.read_version("v").await.expect("read"), 1);
    }

    #[tokio::test]
    async fn lock_is_all_or_nothing() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);

        assert_eq!(store.lock(&keys(&["b"]), "other", ttl, None).await.expect("lock"), Versioned::Current(true));
        assert_eq!(
            store.lock(&keys(&["a", "b", "c"]), "mine", ttl, None).await.expect("lock"),
            Versioned::Current(false)
        );
        assert_eq!(store.keys(), keys(&["b"]));
    }

    #[tokio::test]
    async fn unlock_requires_matching_token() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        store.lock(&keys(&["a"]), "mine", ttl, None).await.expect("lock");

        assert_eq!(store.unlock(&keys(&["a"]), "other", None).await.expect("unlock"), Versioned::Current(0));
        assert_eq!(store.unlock(&keys(&["a"]), "mine", None).await.expect("unlock"), Versioned::Current(1));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_reports_residual_ttl_and_slides() {
        let store = MemoryStore::new();
        store.raw_set("k", "v", Some(Duration::from_secs(10)));
        tokio::time::advance(Duration::from_secs(4)).await;

        let fetched = store
            .fetch(
                &keys(&["k", "missing"]),
                FetchOptions {
                    sliding_ttl: None,
                    with_ttl: true,
                },
                None,
            )
            .await
            .expect("fetch")
            .current()
            .expect("unguarded");
        assert_eq!(fetched[0].as_ref().and_then(|f| f.ttl), Some(Duration::from_secs(6)));
        assert_eq!(fetched[1], None);

        let options = FetchOptions {
            sliding_ttl: Some(Duration::from_secs(10)),
            with_ttl: false,
        };
        store.fetch(&keys(&["k"]), options, None).await.expect("fetch");
        assert_eq!(store.raw_ttl("k"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.raw_get("k"), None);
    }

    #[tokio::test]
    async fn publishes_to_subscribers_and_counts_them() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("c").await.expect("subscribe");
        let mut second = store.subscribe("c").await.expect("subscribe");

        assert_eq!(store.publish("c", Bytes::from_static(b"hello")).await.expect("publish"), 2);
        assert_eq!(first.next().await, Some(StoreEvent::Message(Bytes::from_static(b"hello"))));
        assert_eq!(second.next().await, Some(StoreEvent::Message(Bytes::from_static(b"hello"))));

        drop(second);
        store.disrupt("test");
        assert_eq!(first.next().await, Some(StoreEvent::Disrupted("test".to_owned())));
        assert_eq!(store.publish("c", Bytes::new()).await.expect("publish"), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_recorded() {
        let store = MemoryStore::new();
        store.fail_when(|op| matches!(op, StoreOp::Delete(_)));

        let error = store.delete(&keys(&["a"]), None, None).await.expect_err("injected");
        assert!(matches!(error, Error::Store(_)));
        assert_eq!(store.operations(), vec![StoreOp::Delete(keys(&["a"]))]);

        store.clear_failures();
        store.delete(&keys(&["a"]), None, None).await.expect("no failure");
    }

    #[tokio::test]
    async fn multi_key_lock_requires_batch_scripts() {
        let store = MemoryStore::new();
        store.set_batch_scripts(false);

        assert!(!store.supports_batch_scripts());
        store
            .lock(&keys(&["a", "b"]), "t", Duration::from_secs(1), None)
            .await
            .expect_err("batch scripts disabled");
        store.lock(&keys(&["a"]), "t", Duration::from_secs(1), None).await.expect("single key");
    }
}
