// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Background delivery of synchronization messages to a strategy.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;

use crate::message::{ClientId, SyncMessage};
use crate::store::{RegionStore, StoreEvent, Subscription};

/// A message a handler wants published in response to an incoming one.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub channel: String,
    pub message: SyncMessage,
}

/// Reacts to events on a region's channels.
///
/// Handlers run synchronously on the listener task and must not block.
pub(crate) trait MessageHandler: Send + Sync + 'static {
    /// Applies a message published by another client.
    fn on_message(&self, message: SyncMessage) -> Vec<Outgoing>;

    /// Reacts to a disruption after which messages may have been missed.
    fn on_disrupted(&self, reason: &str);
}

/// Owns the tasks pumping subscriptions into a handler. Dropping it stops them.
#[derive(Debug)]
pub(crate) struct Listener {
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Spawns one task per subscription.
    ///
    /// The handler is held weakly, so the tasks end once the strategy is gone. Messages
    /// whose origin is `client` are skipped.
    pub fn spawn<S: RegionStore, H: MessageHandler>(store: &Arc<S>, subscriptions: Vec<Subscription>, handler: Weak<H>, client: ClientId) -> Self {
        let tasks = subscriptions
            .into_iter()
            .map(|subscription| tokio::spawn(pump(Arc::clone(store), subscription, Weak::clone(&handler), client)))
            .collect();
        Self { tasks }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn pump<S: RegionStore, H: MessageHandler>(store: Arc<S>, mut subscription: Subscription, handler: Weak<H>, client: ClientId) {
    while let Some(event) = subscription.next().await {
        let Some(handler) = handler.upgrade() else {
            break;
        };

        let outgoing = match event {
            StoreEvent::Message(payload) => match SyncMessage::decode(&payload) {
                Ok(message) if message.origin == client => continue,
                Ok(message) => handler.on_message(message),
                Err(error) => {
                    tracing::event!(
                        name: "region_cache.listener.undecodable",
                        tracing::Level::WARN,
                        cache.channel = subscription.channel(),
                        error = %error,
                        "dropping undecodable message"
                    );
                    continue;
                }
            },
            StoreEvent::Disrupted(reason) => {
                tracing::event!(
                    name: "region_cache.listener.disrupted",
                    tracing::Level::WARN,
                    cache.channel = subscription.channel(),
                    reason = %reason,
                    "subscription disrupted"
                );
                handler.on_disrupted(&reason);
                continue;
            }
        };

        for Outgoing { channel, message } in outgoing {
            let published = match message.encode() {
                Ok(payload) => store.publish(&channel, payload).await.map(drop),
                Err(error) => Err(error),
            };
            if let Err(error) = published {
                tracing::event!(
                    name: "region_cache.listener.reply_failed",
                    tracing::Level::WARN,
                    cache.channel = %channel,
                    error = %error,
                    "failed to publish reply"
                );
            }
        }
    }
}
