// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Replicated region strategy: every client holds the whole region in memory.
//!
//! The store only carries broadcasts. Each mutation is stamped with a logical timestamp and
//! the mutating client's id, applied locally, then broadcast; receivers apply it only when
//! its stamp is newer than what they hold for the key, so every client converges on the
//! last writer's value whatever order the messages arrive in. Removes leave tombstones so
//! that a late, older put cannot bring a key back.
//!
//! Locks are granted by consensus: the requester locks locally, then asks every other
//! subscriber of the region channel to lock on its behalf and waits for all of them to
//! agree.

use std::collections::HashMap;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::{RegionStrategy, check_lock_batch, check_pairs};
use crate::key::KeyCodec;
use crate::listener::{Listener, MessageHandler, Outgoing};
use crate::message::{ClientId, LogicalClock, Operation, Stamp, SyncMessage};
use crate::retry::RetryPolicy;
use crate::store::RegionStore;
use crate::{CacheKey, Error, LockToken, RegionConfig, Result};

/// How long removals are remembered when the region has no expiration.
const TOMBSTONE_RETENTION: Duration = Duration::from_secs(60);

/// Minimum time between two sweeps of expired replicas.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
struct Replica {
    value: Option<Bytes>,
    stamp: Stamp,
    expires_at: Option<Instant>,
}

impl Replica {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug)]
struct LockHolder {
    token: String,
    expires_at: Instant,
}

/// The replicated entries and lock table of one client.
#[derive(Debug, Default)]
struct ReplicaSet {
    entries: DashMap<String, Replica>,
    cleared_at: RwLock<Option<Stamp>>,
    locks: Mutex<HashMap<String, LockHolder>>,
    next_sweep: Mutex<Option<Instant>>,
}

impl ReplicaSet {
    fn get(&self, key: &str, now: Instant) -> Option<Bytes> {
        let found = self
            .entries
            .get(key)
            .map(|replica| replica.is_live(now).then(|| replica.value.clone()));
        match found {
            Some(Some(value)) => value,
            Some(None) => {
                self.entries.remove_if(key, |_, replica| !replica.is_live(now));
                None
            }
            None => None,
        }
    }

    /// Drops expired entries and tombstones, at most once per [`SWEEP_INTERVAL`].
    fn sweep(&self, now: Instant) {
        {
            let mut next_sweep = self.next_sweep.lock();
            if next_sweep.is_some_and(|at| at > now) {
                return;
            }
            *next_sweep = Some(now + SWEEP_INTERVAL);
        }
        self.entries.retain(|_, replica| replica.is_live(now));
    }

    /// Applies a mutation if it is newer than the current state of `key`.
    ///
    /// Returns whether a live value was replaced or removed.
    fn apply(&self, key: String, value: Option<Bytes>, stamp: Stamp, expires_at: Option<Instant>, now: Instant) -> Option<bool> {
        let applied = {
            let cleared_at = self.cleared_at.read();
            if cleared_at.is_some_and(|cleared| stamp <= cleared) {
                return None;
            }

            let replica = Replica { value, stamp, expires_at };
            match self.entries.entry(key) {
                Entry::Occupied(mut occupied) => {
                    let current = occupied.get();
                    if current.is_live(now) && current.stamp >= stamp {
                        return None;
                    }
                    let had_value = current.is_live(now) && current.value.is_some();
                    occupied.insert(replica);
                    had_value
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(replica);
                    false
                }
            }
        };
        self.sweep(now);
        Some(applied)
    }

    fn clear(&self, stamp: Stamp) {
        let mut cleared_at = self.cleared_at.write();
        if cleared_at.is_some_and(|cleared| cleared >= stamp) {
            return;
        }
        *cleared_at = Some(stamp);
        self.entries.retain(|_, replica| replica.stamp > stamp);
    }

    fn flush(&self) {
        self.entries.clear();
    }

    fn try_lock(&self, keys: &[String], token: &str, expires_at: Instant, now: Instant) -> bool {
        let mut locks = self.locks.lock();
        let contended = keys.iter().any(|key| {
            locks
                .get(key)
                .is_some_and(|holder| holder.expires_at > now && holder.token != token)
        });
        if contended {
            return false;
        }
        for key in keys {
            locks.insert(
                key.clone(),
                LockHolder {
                    token: token.to_owned(),
                    expires_at,
                },
            );
        }
        true
    }

    fn unlock(&self, keys: &[String], token: &str) -> u64 {
        let mut locks = self.locks.lock();
        let mut released = 0;
        for key in keys {
            if locks.get(key).is_some_and(|holder| holder.token == token) {
                locks.remove(key);
                released += 1;
            }
        }
        released
    }
}

#[derive(Debug)]
struct Replicated<S> {
    store: Arc<S>,
    config: RegionConfig,
    codec: KeyCodec,
    channel: String,
    reply_channel: String,
    client: ClientId,
    clock: LogicalClock,
    replicas: ReplicaSet,
    pending: Mutex<HashMap<Uuid, mpsc::UnboundedSender<bool>>>,
}

/// Removes a pending lock request when the waiting attempt ends, however it ends.
struct PendingReplies<'a> {
    pending: &'a Mutex<HashMap<Uuid, mpsc::UnboundedSender<bool>>>,
    request_id: Uuid,
}

impl Drop for PendingReplies<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

impl<S: RegionStore> Replicated<S> {
    fn local_keys(&self, keys: &[CacheKey]) -> Vec<String> {
        keys.iter().map(|key| self.codec.cache_key(key, None)).collect()
    }

    fn expiry(&self, now: Instant) -> Option<Instant> {
        self.config.ttl().map(|ttl| now + ttl)
    }

    fn tombstone_expiry(&self, now: Instant) -> Instant {
        now + self.config.ttl().unwrap_or(TOMBSTONE_RETENTION)
    }

    fn stamp(&self) -> Stamp {
        Stamp {
            timestamp: self.clock.tick(),
            origin: self.client,
        }
    }

    async fn broadcast(&self, channel: &str, stamp: Stamp, operation: Operation) -> Result<u64> {
        let payload = SyncMessage::new(stamp.origin, stamp.timestamp, operation).encode()?;
        self.store.publish(channel, payload).await
    }

    /// Applies a peer's message and returns the replies it calls for.
    fn handle(&self, message: SyncMessage, now: Instant) -> Vec<Outgoing> {
        self.clock.observe(message.timestamp);
        let stamp = message.stamp();

        match message.operation {
            Operation::Put { entries } => {
                for (key, value) in entries {
                    if let Some(value) = value {
                        self.replicas.apply(key, Some(value), stamp, self.expiry(now), now);
                    }
                }
            }
            Operation::Remove { keys } => {
                for key in keys {
                    self.replicas.apply(key, None, stamp, Some(self.tombstone_expiry(now)), now);
                }
            }
            Operation::Clear { .. } => self.replicas.clear(stamp),
            Operation::Lock {
                request_id,
                keys,
                token,
                reply_to,
            } => {
                let acquired = self.replicas.try_lock(&keys, &token, now + self.config.lock().key_timeout(), now);
                let reply = SyncMessage::new(self.client, self.clock.tick(), Operation::LockReply { request_id, acquired });
                return vec![Outgoing {
                    channel: reply_to,
                    message: reply,
                }];
            }
            Operation::LockReply { request_id, acquired } => {
                if let Some(waiter) = self.pending.lock().get(&request_id) {
                    let _ = waiter.send(acquired);
                }
            }
            Operation::Unlock { keys, token } => {
                self.replicas.unlock(&keys, &token);
            }
        }
        Vec::new()
    }

    /// One consensus round: lock locally, then collect every peer's agreement.
    async fn try_lock(&self, keys: &[String], token: &LockToken) -> Result<bool> {
        let now = Instant::now();
        let lock_config = self.config.lock();
        if !self.replicas.try_lock(keys, token.as_str(), now + lock_config.key_timeout(), now) {
            return Ok(false);
        }
        if !self.config.uses_pubsub() {
            return Ok(true);
        }

        let request_id = Uuid::new_v4();
        let (sender, mut replies) = mpsc::unbounded_channel();
        self.pending.lock().insert(request_id, sender);
        let _pending = PendingReplies {
            pending: &self.pending,
            request_id,
        };

        let request = Operation::Lock {
            request_id,
            keys: keys.to_vec(),
            token: token.as_str().to_owned(),
            reply_to: self.reply_channel.clone(),
        };
        let receivers = match self.broadcast(&self.channel, self.stamp(), request).await {
            Ok(receivers) => receivers,
            Err(error) => {
                self.replicas.unlock(keys, token.as_str());
                return Err(error);
            }
        };

        let expected = receivers.saturating_sub(1);
        let deadline = Instant::now() + lock_config.acquire_timeout();
        let mut granted = 0;
        while granted < expected {
            match tokio::time::timeout_at(deadline, replies.recv()).await {
                Ok(Some(true)) => granted += 1,
                _ => break,
            }
        }
        if granted == expected {
            return Ok(true);
        }

        tracing::event!(
            name: "region_cache.lock.refused",
            tracing::Level::DEBUG,
            cache.region = self.config.name(),
            lock.granted = granted,
            lock.expected = expected,
            "peers did not grant the lock"
        );
        self.replicas.unlock(keys, token.as_str());
        let unwind = Operation::Unlock {
            keys: keys.to_vec(),
            token: token.as_str().to_owned(),
        };
        self.broadcast(&self.channel, self.stamp(), unwind).await?;
        Ok(false)
    }

    async fn lock(&self, keys: &[CacheKey]) -> Result<LockToken> {
        check_lock_batch(keys)?;
        let local_keys = self.local_keys(keys);
        let token = LockToken::new();

        let outcome = RetryPolicy::for_locks(self.config.lock())
            .execute(
                |_| self.try_lock(&local_keys, &token),
                |outcome| matches!(outcome, Ok(false)),
                |_| async {},
            )
            .await;

        let acquired = outcome.map_err(|exhausted| {
            tracing::event!(
                name: "region_cache.lock.failed",
                tracing::Level::WARN,
                cache.region = self.config.name(),
                lock.keys = keys.len(),
                lock.attempts = exhausted.attempts(),
                "failed to acquire lock"
            );
            Error::LockAcquisition {
                keys: keys.len(),
                attempts: exhausted.attempts(),
                elapsed: exhausted.elapsed(),
            }
        })??;

        // Refusals are retried until the budget runs out.
        debug_assert!(acquired, "a refused lock left the retry loop");
        Ok(token)
    }

    async fn unlock(&self, keys: &[CacheKey], token: &LockToken) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let local_keys = self.local_keys(keys);
        let released = self.replicas.unlock(&local_keys, token.as_str());
        if self.config.uses_pubsub() {
            let unlock = Operation::Unlock {
                keys: local_keys,
                token: token.as_str().to_owned(),
            };
            self.broadcast(&self.channel, self.stamp(), unlock).await?;
        }
        Ok(released)
    }

    async fn put_many(&self, keys: &[CacheKey], values: &[Bytes]) -> Result<()> {
        check_pairs(keys, values)?;
        if keys.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let stamp = self.stamp();
        let entries: Vec<(String, Option<Bytes>)> = self.local_keys(keys).into_iter().zip(values.iter().cloned().map(Some)).collect();
        for (key, value) in &entries {
            self.replicas.apply(key.clone(), value.clone(), stamp, self.expiry(now), now);
        }
        if self.config.uses_pubsub() {
            self.broadcast(&self.channel, stamp, Operation::Put { entries }).await?;
        }
        Ok(())
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let now = Instant::now();
        let stamp = self.stamp();
        let local_keys = self.local_keys(keys);
        let removed = local_keys
            .iter()
            .filter(|key| self.replicas.apply((*key).clone(), None, stamp, Some(self.tombstone_expiry(now)), now) == Some(true))
            .count() as u64;
        if self.config.uses_pubsub() {
            self.broadcast(&self.channel, stamp, Operation::Remove { keys: local_keys }).await?;
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        let stamp = self.stamp();
        self.replicas.clear(stamp);
        tracing::event!(
            name: "region_cache.region.cleared",
            tracing::Level::INFO,
            cache.region = self.config.name(),
            "cleared region"
        );
        if self.config.uses_pubsub() {
            self.broadcast(&self.channel, stamp, Operation::Clear { version: None }).await?;
        }
        Ok(())
    }
}

impl<S: RegionStore> MessageHandler for Replicated<S> {
    fn on_message(&self, message: SyncMessage) -> Vec<Outgoing> {
        self.handle(message, Instant::now())
    }

    fn on_disrupted(&self, _reason: &str) {
        self.replicas.flush();
    }
}

/// Values held in every client's memory and replicated by broadcast.
///
/// Suited to small, read-mostly regions: reads never leave the process, and the store is
/// used only to carry mutations between clients.
#[derive(Debug)]
pub struct ReplicatedStrategy<S> {
    inner: Arc<Replicated<S>>,
    _listener: Option<Listener>,
}

impl<S: RegionStore> ReplicatedStrategy<S> {
    /// Joins the region's broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the configuration is invalid and
    /// [`Error::Store`] when the region channels cannot be subscribed to.
    pub async fn new(store: Arc<S>, config: RegionConfig) -> Result<Self> {
        config.validate()?;
        let codec = KeyCodec::new(&config);
        let client = ClientId::new();
        let inner = Arc::new(Replicated {
            channel: codec.channel(),
            reply_channel: codec.reply_channel(&client),
            store,
            config,
            codec,
            client,
            clock: LogicalClock::default(),
            replicas: ReplicaSet::default(),
            pending: Mutex::new(HashMap::new()),
        });

        let listener = if inner.config.uses_pubsub() {
            let subscriptions = vec![
                inner.store.subscribe(&inner.channel).await?,
                inner.store.subscribe(&inner.reply_channel).await?,
            ];
            Some(Listener::spawn(&inner.store, subscriptions, Arc::downgrade(&inner), client))
        } else {
            None
        };

        Ok(Self {
            inner,
            _listener: listener,
        })
    }

    /// This client's identity within the region.
    #[must_use]
    pub fn client(&self) -> ClientId {
        self.inner.client
    }
}

impl<S: RegionStore> RegionStrategy for ReplicatedStrategy<S> {
    fn config(&self) -> &RegionConfig {
        &self.inner.config
    }

    fn cache_key(&self, key: &CacheKey) -> String {
        self.inner.codec.cache_key(key, None)
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        Ok(self.inner.replicas.get(&self.cache_key(key), Instant::now()))
    }

    async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<Bytes>>> {
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| self.inner.replicas.get(&self.cache_key(key), now))
            .collect())
    }

    async fn put(&self, key: &CacheKey, value: Bytes) -> Result<()> {
        self.inner.put_many(slice::from_ref(key), slice::from_ref(&value)).await
    }

    async fn put_many(&self, keys: &[CacheKey], values: &[Bytes]) -> Result<()> {
        self.inner.put_many(keys, values).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.inner.remove_many(slice::from_ref(key)).await? > 0)
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> Result<u64> {
        self.inner.remove_many(keys).await
    }

    async fn lock(&self, key: &CacheKey) -> Result<LockToken> {
        self.inner.lock(slice::from_ref(key)).await
    }

    async fn lock_many(&self, keys: &[CacheKey]) -> Result<LockToken> {
        self.inner.lock(keys).await
    }

    async fn unlock(&self, key: &CacheKey, token: &LockToken) -> Result<bool> {
        Ok(self.inner.unlock(slice::from_ref(key), token).await? > 0)
    }

    async fn unlock_many(&self, keys: &[CacheKey], token: &LockToken) -> Result<u64> {
        self.inner.unlock(keys, token).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}
