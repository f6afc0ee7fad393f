// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Region configuration.
//!
//! A [`RegionConfig`] describes one cache region: how its keys are named, how long its
//! entries live, which strategy keeps it coherent and how its locks behave. Hosts usually
//! describe all regions at once with [`CacheSettings`], which holds global defaults plus
//! per-region [`RegionOverrides`].
//!
//! Every structure implements [`serde::Deserialize`], so settings can be loaded from any
//! format the host already uses. Durations are expressed in seconds, except the retry
//! delays which are expressed in milliseconds.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use region_cache::{RegionConfig, StrategyKind};
//!
//! let config = RegionConfig::new("orders")
//!     .expire_after(Duration::from_secs(500))
//!     .use_sliding_expiration(true)
//!     .strategy(StrategyKind::TwoLayer);
//!
//! assert_eq!(config.name(), "orders");
//! assert!(config.validate().is_ok());
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::codec::Codec;
use crate::strategy::StrategyKind;
use crate::{Error, Result};

const DEFAULT_KEY_PREFIX: &str = "region-cache:";
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(300);
const DEFAULT_MAX_ALLOWED_VERSION: u64 = 1000;
const DEFAULT_STALE_READ_RETRIES: u32 = 1;

/// Lock tuning shared by every strategy that supports locking.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(deserialize_with = "secs")]
    key_timeout: Duration,
    #[serde(deserialize_with = "secs")]
    acquire_timeout: Duration,
    retry_times: u32,
    #[serde(deserialize_with = "millis")]
    min_retry_delay: Duration,
    #[serde(deserialize_with = "millis")]
    max_retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            retry_times: 3,
            min_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(400),
        }
    }
}

impl LockConfig {
    /// How long a lock key lives before the store reclaims it.
    #[must_use]
    pub fn key_timeout(&self) -> Duration {
        self.key_timeout
    }

    /// Time budget for acquiring a lock, across all attempts.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Attempt budget for acquiring a lock.
    #[must_use]
    pub fn retry_times(&self) -> u32 {
        self.retry_times
    }

    /// Lower bound of the randomized delay between attempts.
    #[must_use]
    pub fn min_retry_delay(&self) -> Duration {
        self.min_retry_delay
    }

    /// Upper bound of the randomized delay between attempts.
    #[must_use]
    pub fn max_retry_delay(&self) -> Duration {
        self.max_retry_delay
    }

    /// Sets the lock key time-to-live.
    #[must_use]
    pub fn with_key_timeout(mut self, timeout: Duration) -> Self {
        self.key_timeout = timeout;
        self
    }

    /// Sets the acquisition time budget.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the acquisition attempt budget.
    #[must_use]
    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    /// Sets the bounds of the randomized delay between attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_delay = min;
        self.max_retry_delay = max;
        self
    }
}

/// Immutable description of one cache region.
///
/// Built once per region and shared by every task that uses it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    name: String,
    key_prefix: String,
    environment: Option<String>,
    region_prefix: Option<String>,
    #[serde(deserialize_with = "secs")]
    expiration: Duration,
    use_sliding_expiration: bool,
    append_hashcode: bool,
    database: u32,
    strategy: StrategyKind,
    lock: LockConfig,
    max_allowed_version: u64,
    stale_read_retries: u32,
    use_pubsub: bool,
    serializer: Codec,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            environment: None,
            region_prefix: None,
            expiration: DEFAULT_EXPIRATION,
            use_sliding_expiration: false,
            append_hashcode: false,
            database: 0,
            strategy: StrategyKind::default(),
            lock: LockConfig::default(),
            max_allowed_version: DEFAULT_MAX_ALLOWED_VERSION,
            stale_read_retries: DEFAULT_STALE_READ_RETRIES,
            use_pubsub: true,
            serializer: Codec::default(),
        }
    }
}

impl RegionConfig {
    /// Creates a configuration with default settings for the named region.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Region name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store-wide key of this region: prefix, environment, region prefix and name.
    #[must_use]
    pub fn region_key(&self) -> String {
        let mut key = String::with_capacity(self.key_prefix.len() + self.name.len() + 16);
        key.push_str(&self.key_prefix);
        if let Some(environment) = &self.environment {
            key.push_str(environment);
            key.push(':');
        }
        if let Some(prefix) = &self.region_prefix {
            key.push_str(prefix);
        }
        key.push_str(&self.name);
        key
    }

    /// Entry time-to-live; zero disables expiration.
    #[must_use]
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Entry time-to-live, or `None` when expiration is disabled.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        (!self.expiration.is_zero()).then_some(self.expiration)
    }

    /// Whether reads refresh the time-to-live.
    #[must_use]
    pub fn uses_sliding_expiration(&self) -> bool {
        self.use_sliding_expiration
    }

    /// Whether derived keys carry the application key's hash.
    #[must_use]
    pub fn appends_hashcode(&self) -> bool {
        self.append_hashcode
    }

    /// Backing-store logical database.
    #[must_use]
    pub fn database(&self) -> u32 {
        self.database
    }

    /// Strategy that keeps this region coherent.
    #[must_use]
    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy
    }

    /// Lock tuning.
    #[must_use]
    pub fn lock(&self) -> &LockConfig {
        &self.lock
    }

    /// Ceiling above which the generation wraps back to 1.
    #[must_use]
    pub fn max_allowed_version(&self) -> u64 {
        self.max_allowed_version
    }

    /// How many times a read retries after finding a newer generation.
    #[must_use]
    pub fn stale_read_retries(&self) -> u32 {
        self.stale_read_retries
    }

    /// Whether mutations are broadcast to other clients.
    #[must_use]
    pub fn uses_pubsub(&self) -> bool {
        self.use_pubsub
    }

    /// Codec used by the typed region facade.
    #[must_use]
    pub fn serializer(&self) -> Codec {
        self.serializer
    }

    /// Sets the store-wide key prefix.
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the environment segment of the region key.
    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Sets the region prefix segment of the region key.
    #[must_use]
    pub fn region_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.region_prefix = Some(prefix.into());
        self
    }

    /// Sets the entry time-to-live. Zero disables expiration.
    #[must_use]
    pub fn expire_after(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Enables or disables sliding expiration.
    #[must_use]
    pub fn use_sliding_expiration(mut self, enabled: bool) -> Self {
        self.use_sliding_expiration = enabled;
        self
    }

    /// Enables or disables the hash suffix on derived keys.
    #[must_use]
    pub fn append_hashcode(mut self, enabled: bool) -> Self {
        self.append_hashcode = enabled;
        self
    }

    /// Selects the backing-store logical database.
    #[must_use]
    pub fn database_index(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    /// Selects the region strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Replaces the lock tuning.
    #[must_use]
    pub fn lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the generation wrap ceiling.
    #[must_use]
    pub fn max_version(mut self, max: u64) -> Self {
        self.max_allowed_version = max;
        self
    }

    /// Sets how many times reads retry after a generation change.
    #[must_use]
    pub fn stale_retries(mut self, retries: u32) -> Self {
        self.stale_read_retries = retries;
        self
    }

    /// Enables or disables broadcast of mutations.
    #[must_use]
    pub fn use_pubsub(mut self, enabled: bool) -> Self {
        self.use_pubsub = enabled;
        self
    }

    /// Selects the value codec.
    #[must_use]
    pub fn codec(mut self, codec: Codec) -> Self {
        self.serializer = codec;
        self
    }

    /// Checks the settings that every strategy relies on.
    ///
    /// Strategy-specific rules, such as the versioned strategy refusing a region without
    /// expiration, are checked when the strategy is built.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a setting is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("region name must not be empty"));
        }
        if self.max_allowed_version == 0 {
            return Err(Error::configuration(format!(
                "region `{}`: max allowed version must be positive",
                self.name
            )));
        }
        if self.lock.key_timeout.is_zero() {
            return Err(Error::configuration(format!("region `{}`: lock key timeout must be positive", self.name)));
        }
        if self.lock.min_retry_delay > self.lock.max_retry_delay {
            return Err(Error::configuration(format!(
                "region `{}`: min retry delay {:?} exceeds max retry delay {:?}",
                self.name, self.lock.min_retry_delay, self.lock.max_retry_delay
            )));
        }
        Ok(())
    }
}

/// Per-region settings that override [`CacheSettings`] defaults.
///
/// Every field is optional; unset fields inherit the default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegionOverrides {
    /// Store-wide key prefix.
    pub key_prefix: Option<String>,
    /// Environment segment of the region key.
    pub environment: Option<String>,
    /// Region prefix segment of the region key.
    pub region_prefix: Option<String>,
    /// Entry time-to-live, in seconds when deserialized.
    #[serde(deserialize_with = "opt_secs")]
    pub expiration: Option<Duration>,
    /// Sliding expiration flag.
    pub use_sliding_expiration: Option<bool>,
    /// Hash suffix flag.
    pub append_hashcode: Option<bool>,
    /// Backing-store logical database.
    pub database: Option<u32>,
    /// Region strategy.
    pub strategy: Option<StrategyKind>,
    /// Lock tuning, replacing the default lock tuning as a whole.
    pub lock: Option<LockConfig>,
    /// Generation wrap ceiling.
    pub max_allowed_version: Option<u64>,
    /// Stale read retry count.
    pub stale_read_retries: Option<u32>,
    /// Broadcast flag.
    pub use_pubsub: Option<bool>,
    /// Value codec.
    pub serializer: Option<Codec>,
}

impl RegionOverrides {
    fn apply(&self, mut config: RegionConfig) -> RegionConfig {
        if let Some(prefix) = &self.key_prefix {
            config.key_prefix.clone_from(prefix);
        }
        if let Some(environment) = &self.environment {
            config.environment = Some(environment.clone());
        }
        if let Some(prefix) = &self.region_prefix {
            config.region_prefix = Some(prefix.clone());
        }
        if let Some(lock) = &self.lock {
            config.lock = lock.clone();
        }
        config.expiration = self.expiration.unwrap_or(config.expiration);
        config.use_sliding_expiration = self.use_sliding_expiration.unwrap_or(config.use_sliding_expiration);
        config.append_hashcode = self.append_hashcode.unwrap_or(config.append_hashcode);
        config.database = self.database.unwrap_or(config.database);
        config.strategy = self.strategy.unwrap_or(config.strategy);
        config.max_allowed_version = self.max_allowed_version.unwrap_or(config.max_allowed_version);
        config.stale_read_retries = self.stale_read_retries.unwrap_or(config.stale_read_retries);
        config.use_pubsub = self.use_pubsub.unwrap_or(config.use_pubsub);
        config.serializer = self.serializer.unwrap_or(config.serializer);
        config
    }
}

/// Settings for every region of a process: global defaults plus per-region overrides.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use region_cache::{CacheSettings, RegionOverrides};
///
/// let settings = CacheSettings::default().with_region(
///     "foo",
///     RegionOverrides {
///         expiration: Some(Duration::from_secs(500)),
///         use_sliding_expiration: Some(true),
///         ..RegionOverrides::default()
///     },
/// );
///
/// let foo = settings.region("foo");
/// assert_eq!(foo.expiration(), Duration::from_secs(500));
/// assert!(foo.uses_sliding_expiration());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    defaults: RegionConfig,
    regions: HashMap<String, RegionOverrides>,
}

impl CacheSettings {
    /// Creates settings whose regions start from `defaults`.
    #[must_use]
    pub fn new(defaults: RegionConfig) -> Self {
        Self {
            defaults,
            regions: HashMap::new(),
        }
    }

    /// Registers overrides for one region.
    #[must_use]
    pub fn with_region(mut self, name: impl Into<String>, overrides: RegionOverrides) -> Self {
        self.regions.insert(name.into(), overrides);
        self
    }

    /// Resolves the configuration of the named region.
    #[must_use]
    pub fn region(&self, name: &str) -> RegionConfig {
        let mut config = self.defaults.clone();
        config.name = name.to_owned();
        match self.regions.get(name) {
            Some(overrides) => overrides.apply(config),
            None => config,
        }
    }
}

fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn opt_secs<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
}
