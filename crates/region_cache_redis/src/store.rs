// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug};
use std::time::Duration;

use bytes::Bytes;
use redis::Client;
use redis::aio::ConnectionManager;
use region_cache::{Error, FetchOptions, Fetched, Publication, RegionStore, Result, StoreEvent, Subscription, VersionGuard, Versioned};
use tokio::sync::mpsc;

use crate::pubsub::{self, ReconnectBackoff};
use crate::scripts;

/// A [`RegionStore`] backed by Redis.
///
/// Commands share one multiplexed connection that reconnects on its own. Every multi-key
/// or guarded operation runs as a single Lua script, including the notification published
/// with a write. Each subscription runs on a dedicated connection that is re-established
/// after failures, reporting [`StoreEvent::Disrupted`] around the gap.
///
/// All keys of a region share a hash tag, so regions work on clustered deployments too.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use region_cache::{CacheSettings, RegionFactory};
/// use region_cache_redis::RedisStore;
///
/// # #[tokio::main]
/// # async fn main() -> region_cache::Result<()> {
/// let store = RedisStore::connect("redis://127.0.0.1/0").await?;
/// let factory = RegionFactory::new(Arc::new(store), CacheSettings::default());
///
/// let orders = factory.region("orders").await?;
/// orders.put(&42, &"pending").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    database: u32,
    batch_scripts: bool,
    backoff: ReconnectBackoff,
}

impl Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("database", &self.database)
            .field("batch_scripts", &self.batch_scripts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to the server at `url`, for example `redis://127.0.0.1/2`.
    ///
    /// The database index in the URL is the one regions must be configured with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a malformed URL and [`Error::Store`] when the
    /// server cannot be reached.
    #[cfg_attr(test, mutants::skip)] // Needs a live server.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|error| Error::configuration(format!("invalid redis url: {error}")))?;
        Self::from_client(client).await
    }

    /// Connects with an already configured client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the client selects a negative database and
    /// [`Error::Store`] when the server cannot be reached.
    #[cfg_attr(test, mutants::skip)] // Needs a live server.
    pub async fn from_client(client: Client) -> Result<Self> {
        let database = database_index(client.get_connection_info().redis.db)?;
        let connection = client.get_connection_manager().await.map_err(Error::store)?;
        Ok(Self {
            client,
            connection,
            database,
            batch_scripts: true,
            backoff: ReconnectBackoff::default(),
        })
    }

    /// Enables or disables atomic multi-key locking.
    ///
    /// Some proxies reject scripts spanning several keys; with batch scripts disabled,
    /// multi-key lock calls fail and strategies fall back to locking keys one by one.
    #[must_use]
    pub fn with_batch_scripts(mut self, enabled: bool) -> Self {
        self.batch_scripts = enabled;
        self
    }

    /// Sets the bounds of the delay between pub/sub reconnection attempts.
    #[must_use]
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = ReconnectBackoff::new(initial, max);
        self
    }
}

fn database_index(db: i64) -> Result<u32> {
    u32::try_from(db).map_err(|error| Error::configuration(format!("invalid redis database index {db}: {error}")))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn residual(ttl: i64) -> Option<Duration> {
    u64::try_from(ttl).ok().map(Duration::from_millis)
}

fn notification(notify: Option<&Publication>) -> (&str, &[u8]) {
    notify.map_or(("", &[][..]), |publication| (publication.channel.as_str(), &publication.payload[..]))
}

/// Interprets a script result where -1 marks a stale generation.
fn counted(result: i64) -> Versioned<u64> {
    u64::try_from(result).map_or(Versioned::Stale, Versioned::Current)
}

impl RegionStore for RedisStore {
    async fn fetch(&self, keys: &[String], options: FetchOptions, guard: Option<&VersionGuard>) -> Result<Versioned<Vec<Option<Fetched>>>> {
        let mut invocation = scripts::invoke(&scripts::FETCH, guard);
        invocation
            .arg(options.sliding_ttl.map_or(0, millis))
            .arg(if options.with_ttl { "1" } else { "0" });
        for key in keys {
            invocation.key(key);
        }

        let mut connection = self.connection.clone();
        let (status, values, ttls): (i64, Vec<Option<Vec<u8>>>, Vec<i64>) =
            invocation.invoke_async(&mut connection).await.map_err(Error::store)?;
        if status == 0 {
            return Ok(Versioned::Stale);
        }

        Ok(Versioned::Current(
            values
                .into_iter()
                .zip(ttls)
                .map(|(value, ttl)| {
                    value.map(|value| Fetched {
                        value: Bytes::from(value),
                        ttl: residual(ttl),
                    })
                })
                .collect(),
        ))
    }

    async fn store(
        &self,
        entries: &[(String, Bytes)],
        ttl: Option<Duration>,
        guard: Option<&VersionGuard>,
        notify: Option<&Publication>,
    ) -> Result<Versioned<()>> {
        let (channel, payload) = notification(notify);
        let mut invocation = scripts::invoke(&scripts::STORE, guard);
        invocation.arg(ttl.map_or(0, millis)).arg(channel).arg(payload);
        for (key, value) in entries {
            invocation.key(key).arg(&value[..]);
        }

        let mut connection = self.connection.clone();
        let status: i64 = invocation.invoke_async(&mut connection).await.map_err(Error::store)?;
        Ok(if status == 0 { Versioned::Stale } else { Versioned::Current(()) })
    }

    async fn delete(&self, keys: &[String], guard: Option<&VersionGuard>, notify: Option<&Publication>) -> Result<Versioned<u64>> {
        let (channel, payload) = notification(notify);
        let mut invocation = scripts::invoke(&scripts::DELETE, guard);
        invocation.arg(channel).arg(payload);
        for key in keys {
            invocation.key(key);
        }

        let mut connection = self.connection.clone();
        let removed: i64 = invocation.invoke_async(&mut connection).await.map_err(Error::store)?;
        Ok(counted(removed))
    }

    async fn lock(&self, keys: &[String], token: &str, ttl: Duration, guard: Option<&VersionGuard>) -> Result<Versioned<bool>> {
        if keys.len() > 1 && !self.batch_scripts {
            return Err(Error::store("redis store: multi-key scripts are disabled"));
        }

        let mut invocation = scripts::invoke(&scripts::LOCK, guard);
        invocation.arg(token).arg(millis(ttl));
        for key in keys {
            invocation.key(key);
        }

        let mut connection = self.connection.clone();
        let acquired: i64 = invocation.invoke_async(&mut connection).await.map_err(Error::store)?;
        Ok(match acquired {
            -1 => Versioned::Stale,
            acquired => Versioned::Current(acquired == 1),
        })
    }

    async fn unlock(&self, keys: &[String], token: &str, guard: Option<&VersionGuard>) -> Result<Versioned<u64>> {
        let mut invocation = scripts::invoke(&scripts::UNLOCK, guard);
        invocation.arg(token);
        for key in keys {
            invocation.key(key);
        }

        let mut connection = self.connection.clone();
        let released: i64 = invocation.invoke_async(&mut connection).await.map_err(Error::store)?;
        Ok(counted(released))
    }

    async fn read_version(&self, key: &str) -> Result<u64> {
        let mut connection = self.connection.clone();
        scripts::READ_VERSION_SCRIPT
            .key(key)
            .invoke_async(&mut connection)
            .await
            .map_err(Error::store)
    }

    async fn bump_version(&self, key: &str, max: u64) -> Result<u64> {
        let mut connection = self.connection.clone();
        scripts::BUMP_VERSION_SCRIPT
            .key(key)
            .arg(max)
            .invoke_async(&mut connection)
            .await
            .map_err(Error::store)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64> {
        let mut connection = self.connection.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&payload[..])
            .query_async(&mut connection)
            .await
            .map_err(Error::store)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let pubsub = pubsub::open(&self.client, channel).await.map_err(Error::store)?;
        let (sender, receiver) = mpsc::unbounded_channel::<StoreEvent>();
        tokio::spawn(pubsub::pump(self.client.clone(), channel.to_owned(), pubsub, self.backoff, sender));
        Ok(Subscription::new(channel, receiver))
    }

    fn supports_batch_scripts(&self) -> bool {
        self.batch_scripts
    }

    fn database(&self) -> u32 {
        self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_index_must_fit() {
        assert_eq!(database_index(3).expect("valid"), 3);
        assert!(matches!(database_index(-1), Err(Error::Configuration(_))));
    }

    #[test]
    fn durations_become_positive_millis() {
        assert_eq!(millis(Duration::from_secs(500)), 500_000);
        assert_eq!(millis(Duration::from_micros(10)), 1);
    }

    #[test]
    fn negative_ttls_mean_no_expiry() {
        assert_eq!(residual(-1), None);
        assert_eq!(residual(-2), None);
        assert_eq!(residual(1500), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn negative_counts_mean_stale() {
        assert_eq!(counted(-1), Versioned::Stale);
        assert_eq!(counted(4), Versioned::Current(4));
    }

    #[test]
    fn missing_notification_is_empty() {
        assert_eq!(notification(None), ("", &[][..]));

        let publication = Publication {
            channel: "{r}:sync".to_owned(),
            payload: Bytes::from_static(b"m"),
        };
        assert_eq!(notification(Some(&publication)), ("{r}:sync", &b"m"[..]));
    }
}
