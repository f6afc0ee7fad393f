// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Distributed locks on cache keys.

use std::fmt::{self, Display};
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::key::KeyCodec;
use crate::retry::RetryPolicy;
use crate::store::{RegionStore, VersionGuard, Versioned};
use crate::{Error, LockConfig, Result};

/// Proof of holding a lock.
///
/// Only the holder of a token can release the keys locked with it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Creates a fresh random token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The token's string form, as written to lock keys.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Acquires and releases lock keys in a store, retrying contended acquisitions.
#[derive(Debug)]
pub(crate) struct DistributedLocker<S> {
    store: Arc<S>,
    policy: RetryPolicy,
    key_ttl: Duration,
}

impl<S: RegionStore> DistributedLocker<S> {
    pub fn new(store: Arc<S>, config: &LockConfig) -> Self {
        Self {
            store,
            policy: RetryPolicy::for_locks(config),
            key_ttl: config.key_timeout(),
        }
    }

    /// Locks the given cache keys together.
    ///
    /// Returns [`Versioned::Stale`] without retrying as soon as `guard` no longer holds.
    pub async fn lock_many(&self, cache_keys: &[String], guard: Option<&VersionGuard>) -> Result<Versioned<LockToken>> {
        let lock_keys: Vec<String> = cache_keys.iter().map(|key| KeyCodec::lock_key(key)).collect();
        let token = LockToken::new();
        let atomic = lock_keys.len() == 1 || self.store.supports_batch_scripts();

        let outcome = self
            .policy
            .execute(
                |_| self.try_lock(&lock_keys, &token, guard, atomic),
                |outcome| matches!(outcome, Ok(Versioned::Current(false))),
                |_| self.release(&lock_keys, &token, atomic),
            )
            .await;

        let outcome = outcome.map_err(|exhausted| {
            tracing::event!(
                name: "region_cache.lock.failed",
                tracing::Level::WARN,
                lock.keys = lock_keys.len(),
                lock.attempts = exhausted.attempts(),
                "failed to acquire lock"
            );
            Error::LockAcquisition {
                keys: lock_keys.len(),
                attempts: exhausted.attempts(),
                elapsed: exhausted.elapsed(),
            }
        })?;

        match outcome? {
            Versioned::Current(acquired) => {
                // Refusals are retried until the budget runs out.
                debug_assert!(acquired, "a refused lock left the retry loop");
                Ok(Versioned::Current(token))
            }
            Versioned::Stale => Ok(Versioned::Stale),
        }
    }

    /// Releases the given cache keys if they are still locked with `token`.
    pub async fn unlock_many(&self, cache_keys: &[String], token: &LockToken, guard: Option<&VersionGuard>) -> Result<Versioned<u64>> {
        let lock_keys: Vec<String> = cache_keys.iter().map(|key| KeyCodec::lock_key(key)).collect();
        self.store.unlock(&lock_keys, token.as_str(), guard).await
    }

    async fn try_lock(&self, lock_keys: &[String], token: &LockToken, guard: Option<&VersionGuard>, atomic: bool) -> Result<Versioned<bool>> {
        if atomic {
            return self.store.lock(lock_keys, token.as_str(), self.key_ttl, guard).await;
        }

        for (index, key) in lock_keys.iter().enumerate() {
            let outcome = self.store.lock(slice::from_ref(key), token.as_str(), self.key_ttl, guard).await;
            if !matches!(outcome, Ok(Versioned::Current(true))) {
                self.release(&lock_keys[..index], token, false).await;
                return outcome;
            }
        }
        Ok(Versioned::Current(true))
    }

    async fn release(&self, lock_keys: &[String], token: &LockToken, atomic: bool) {
        if atomic || lock_keys.is_empty() {
            return;
        }
        if let Err(error) = self.store.unlock(lock_keys, token.as_str(), None).await {
            tracing::event!(
                name: "region_cache.lock.unwind_failed",
                tracing::Level::WARN,
                lock.keys = lock_keys.len(),
                error = %error,
                "failed to release partially acquired lock"
            );
        }
    }
}
