// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use redis::Client;
use redis::aio::PubSub;
use region_cache::{RetryDelay, StoreEvent};
use tokio::sync::mpsc::UnboundedSender;

/// Exponential reconnect delays with jitter, capped at a maximum.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial: initial.min(max),
            max,
        }
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl RetryDelay for ReconnectBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let ceiling = self
            .initial
            .checked_mul(1_u32 << attempt.saturating_sub(1).min(16))
            .map_or(self.max, |delay| delay.min(self.max));
        ceiling.mul_f64(fastrand::f64().mul_add(0.5, 0.5))
    }
}

pub(crate) async fn open(client: &Client, channel: &str) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// Forwards messages of `channel` to `events` until the receiving side is dropped.
///
/// A lost connection is reported as [`StoreEvent::Disrupted`], then the pump reconnects
/// and resubscribes, and reports a second disruption once subscribed again since
/// messages published in between are lost.
#[cfg_attr(test, mutants::skip)] // Needs a live server.
pub(crate) async fn pump(client: Client, channel: String, mut pubsub: PubSub, backoff: ReconnectBackoff, events: UnboundedSender<StoreEvent>) {
    loop {
        {
            let mut messages = pin!(pubsub.on_message());
            loop {
                tokio::select! {
                    message = messages.next() => match message {
                        Some(message) => {
                            if events.send(StoreEvent::Message(Bytes::copy_from_slice(message.get_payload_bytes()))).is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    () = events.closed() => return,
                }
            }
        }

        tracing::event!(
            name: "region_cache.redis.subscription_lost",
            tracing::Level::WARN,
            cache.channel = %channel,
            "pub/sub connection lost"
        );
        if events.send(StoreEvent::Disrupted("pub/sub connection lost".to_owned())).is_err() {
            return;
        }

        pubsub = match reconnect(&client, &channel, backoff, &events).await {
            Some(pubsub) => pubsub,
            None => return,
        };
        if events
            .send(StoreEvent::Disrupted("pub/sub connection re-established".to_owned()))
            .is_err()
        {
            return;
        }
    }
}

#[cfg_attr(test, mutants::skip)] // Needs a live server.
async fn reconnect(client: &Client, channel: &str, backoff: ReconnectBackoff, events: &UnboundedSender<StoreEvent>) -> Option<PubSub> {
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        tokio::select! {
            () = tokio::time::sleep(backoff.next_delay(attempt)) => {}
            () = events.closed() => return None,
        }

        match open(client, channel).await {
            Ok(pubsub) => {
                tracing::event!(
                    name: "region_cache.redis.resubscribed",
                    tracing::Level::INFO,
                    cache.channel = channel,
                    attempts = attempt,
                    "pub/sub subscription restored"
                );
                return Some(pubsub);
            }
            Err(error) => {
                tracing::event!(
                    name: "region_cache.redis.reconnect_failed",
                    tracing::Level::DEBUG,
                    cache.channel = channel,
                    attempts = attempt,
                    error = %error,
                    "pub/sub reconnect failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_within_bounds() {
        let backoff = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(1));

        for attempt in 1..=20 {
            let ceiling = Duration::from_millis(100)
                .saturating_mul(1 << (attempt - 1).min(16))
                .min(Duration::from_secs(1));
            let delay = backoff.next_delay(attempt);
            assert!(delay >= ceiling / 2 && delay <= ceiling, "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn initial_delay_never_exceeds_max() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert!(backoff.next_delay(1) <= Duration::from_secs(1));
    }
}
