// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache keys and the derivation of storage keys.

use std::fmt::{self, Display, Write as _};
use std::hash::{BuildHasher, Hash};

use foldhash::fast::FixedState;

use crate::RegionConfig;
use crate::message::ClientId;

/// Seed shared by every process so that hash suffixes agree across clients.
const KEY_HASH_SEED: u64 = 0x5eed_ca5e_0fc0_ffee;

/// An application key: its string form plus a stable 64-bit hash.
///
/// The hash is computed with a fixed-seed hasher, so the same key yields the same hash in
/// every process that shares a region.
///
/// # Examples
///
/// ```
/// use region_cache::CacheKey;
///
/// let a = CacheKey::new("order-42");
/// let b = CacheKey::from(String::from("order-42"));
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "order-42");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    text: String,
    hash: u64,
}

impl CacheKey {
    /// Creates a cache key from any displayable, hashable application key.
    pub fn new<K: Display + Hash + ?Sized>(key: &K) -> Self {
        Self {
            text: key.to_string(),
            hash: FixedState::with_seed(KEY_HASH_SEED).hash_one(key),
        }
    }

    /// The key's string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The key's stable hash.
    #[must_use]
    pub fn hash_code(&self) -> u64 {
        self.hash
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        let hash = FixedState::with_seed(KEY_HASH_SEED).hash_one(key.as_str());
        Self { text: key, hash }
    }
}

/// Derives every storage key, lock key and channel name of one region.
///
/// The region key is wrapped in braces so that a clustered store places every key of the
/// region in the same slot, which multi-key scripts require.
#[derive(Clone, Debug)]
pub struct KeyCodec {
    tagged: String,
    append_hashcode: bool,
}

impl KeyCodec {
    /// Creates the codec for the region described by `config`.
    #[must_use]
    pub fn new(config: &RegionConfig) -> Self {
        Self {
            tagged: format!("{{{}}}", config.region_key()),
            append_hashcode: config.appends_hashcode(),
        }
    }

    /// Derives the storage key of `key`, optionally embedding a generation.
    ///
    /// # Examples
    ///
    /// ```
    /// use region_cache::{CacheKey, KeyCodec, RegionConfig};
    ///
    /// let codec = KeyCodec::new(&RegionConfig::new("orders"));
    /// let key = CacheKey::new("42");
    ///
    /// assert_eq!(codec.cache_key(&key, Some(3)), "{region-cache:orders}-3:42");
    /// assert_eq!(codec.cache_key(&key, None), "{region-cache:orders}:42");
    /// ```
    #[must_use]
    pub fn cache_key(&self, key: &CacheKey, generation: Option<u64>) -> String {
        let mut out = String::with_capacity(self.tagged.len() + key.text.len() + 24);
        out.push_str(&self.tagged);
        if let Some(generation) = generation {
            let _ = write!(out, "-{generation}");
        }
        out.push(':');
        out.push_str(&key.text);
        if self.append_hashcode {
            let _ = write!(out, "@{}", key.hash);
        }
        out
    }

    /// Key under which the region generation is stored.
    #[must_use]
    pub fn version_key(&self) -> String {
        format!("{}:version", self.tagged)
    }

    /// Lock key guarding `cache_key`.
    #[must_use]
    pub fn lock_key(cache_key: &str) -> String {
        format!("{cache_key}:lock")
    }

    /// Broadcast channel of the region.
    #[must_use]
    pub fn channel(&self) -> String {
        format!("{}:sync", self.tagged)
    }

    /// Private channel on which `client` receives lock replies.
    #[must_use]
    pub fn reply_channel(&self, client: &ClientId) -> String {
        format!("{}:sync:{client}", self.tagged)
    }
}
