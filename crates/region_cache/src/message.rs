// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Synchronization messages exchanged between clients of a region.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Identity of one client process within a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Creates a fresh random client identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing identity.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Coherency stamp of a replicated mutation.
///
/// Ordered by timestamp first and origin second, so two stamps are equal only when they
/// describe the same mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Logical time of the mutation.
    pub timestamp: u64,
    /// Client that performed the mutation.
    pub origin: ClientId,
}

/// Produces strictly increasing timestamps that stay close to wall-clock nanoseconds.
///
/// Timestamps observed on incoming messages push the clock forward, so a local mutation is
/// always stamped after every mutation this client has seen.
#[derive(Debug, Default)]
pub(crate) struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn tick(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| u64::try_from(since.as_nanos()).unwrap_or(u64::MAX));
        let (Ok(previous) | Err(previous)) = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(wall.max(last.saturating_add(1))));
        wall.max(previous.saturating_add(1))
    }

    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }
}

/// The operation carried by a [`SyncMessage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Entries were written. Values are present only when receivers replicate them.
    Put {
        /// Local keys and optional values.
        entries: Vec<(String, Option<Bytes>)>,
    },
    /// Entries were removed.
    Remove {
        /// Local keys.
        keys: Vec<String>,
    },
    /// The region was cleared, optionally moving to a new generation.
    Clear {
        /// Generation adopted by the clearing client.
        version: Option<u64>,
    },
    /// A client asks its peers to lock keys on its behalf.
    Lock {
        /// Correlates replies with this request.
        request_id: Uuid,
        /// Local keys.
        keys: Vec<String>,
        /// Token of the lock holder.
        token: String,
        /// Channel on which replies are expected.
        reply_to: String,
    },
    /// A peer's answer to a lock request.
    LockReply {
        /// The request being answered.
        request_id: Uuid,
        /// Whether the peer granted every key.
        acquired: bool,
    },
    /// A lock holder releases keys.
    Unlock {
        /// Local keys.
        keys: Vec<String>,
        /// Token of the lock holder.
        token: String,
    },
}

/// A message published on a region channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Client that published the message.
    pub origin: ClientId,
    /// Logical time at which the message was produced.
    pub timestamp: u64,
    /// What happened.
    pub operation: Operation,
}

impl SyncMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(origin: ClientId, timestamp: u64, operation: Operation) -> Self {
        Self {
            origin,
            timestamp,
            operation,
        }
    }

    /// Stamp of the mutation this message describes.
    #[must_use]
    pub fn stamp(&self) -> Stamp {
        Stamp {
            timestamp: self.timestamp,
            origin: self.origin,
        }
    }

    /// Encodes the message for publication.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the message cannot be encoded.
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self).map(Bytes::from).map_err(Error::serialization)
    }

    /// Decodes a published message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if `payload` is not a message.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload).map_err(Error::serialization)
    }
}
