// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process layer of the two-layer strategy.
//!
//! Entries are stamped with the region generation and a local epoch. A lookup hits only
//! when both match the current values, so adopting a generation or bumping the epoch
//! invalidates every entry without touching them.
//!
//! Each entry carries a sequence number, bumped by every invalidation. A population that
//! started before an invalidation finds a different sequence number when it completes and
//! is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    value: Bytes,
    generation: u64,
    epoch: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct SlotState {
    seq: u64,
    entry: Option<Entry>,
}

type Slots = DashMap<String, Arc<Mutex<SlotState>>>;

/// Reservation taken before a remote fetch, redeemed to populate the entry afterwards.
#[derive(Debug)]
pub(crate) struct FillTicket {
    slot: Arc<Mutex<SlotState>>,
    seq: u64,
    epoch: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LocalCache {
    slots: RwLock<Arc<Slots>>,
    epoch: AtomicU64,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> Arc<Slots> {
        Arc::clone(&self.slots.read())
    }

    fn slot(&self, key: &str) -> Arc<Mutex<SlotState>> {
        let slots = self.slots();
        if let Some(slot) = slots.get(key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(slots.entry(key.to_owned()).or_default().value())
    }

    /// Returns the value of `key` if it was stored under `generation` in the current epoch
    /// and has not expired. Expired entries are dropped.
    pub fn get(&self, key: &str, generation: u64) -> Option<Bytes> {
        let slots = self.slots();
        let slot = Arc::clone(slots.get(key)?.value());
        let epoch = self.epoch.load(Ordering::Acquire);
        let now = Instant::now();
        let mut state = slot.lock();
        let expired = state.entry.as_ref().is_some_and(|entry| entry.expires_at <= now);
        if expired {
            state.entry = None;
            let seq = state.seq;
            drop(state);
            Self::remove_idle(&slots, key, &slot, seq);
            return None;
        }
        state
            .entry
            .as_ref()
            .filter(|entry| entry.generation == generation && entry.epoch == epoch)
            .map(|entry| entry.value.clone())
    }

    /// Removes the slot of `key` if it is still `slot`, holds no entry and was not
    /// invalidated since `seq` was read.
    fn remove_idle(slots: &Slots, key: &str, slot: &Arc<Mutex<SlotState>>, seq: u64) {
        slots.remove_if(key, |_, current| {
            if !Arc::ptr_eq(current, slot) {
                return false;
            }
            let state = current.lock();
            state.seq == seq && state.entry.is_none()
        });
    }

    /// Reserves `key` for a population after a remote fetch.
    pub fn begin_fill(&self, key: &str) -> FillTicket {
        let epoch = self.epoch.load(Ordering::Acquire);
        let slot = self.slot(key);
        let seq = slot.lock().seq;
        FillTicket { slot, seq, epoch }
    }

    /// Populates the reserved entry unless it was invalidated since the reservation.
    ///
    /// Returns whether the value was kept.
    pub fn complete_fill(&self, ticket: FillTicket, value: Bytes, generation: u64, ttl: Duration) -> bool {
        let mut state = ticket.slot.lock();
        if state.seq != ticket.seq || self.epoch.load(Ordering::Acquire) != ticket.epoch {
            return false;
        }
        state.entry = Some(Entry {
            value,
            generation,
            epoch: ticket.epoch,
            expires_at: Instant::now() + ttl,
        });
        true
    }

    /// Releases the reservation of a key the store did not have.
    pub fn abandon_fill(&self, key: &str, ticket: FillTicket) {
        Self::remove_idle(&self.slots(), key, &ticket.slot, ticket.seq);
    }

    /// Stores a value written by this client, valid until `expires_at`.
    pub fn set(&self, key: &str, value: Bytes, generation: u64, expires_at: Instant) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let slot = self.slot(key);
        let mut state = slot.lock();
        state.seq += 1;
        state.entry = Some(Entry {
            value,
            generation,
            epoch,
            expires_at,
        });
    }

    /// Invalidates `key`, discarding any population in flight.
    pub fn invalidate(&self, key: &str) {
        let slots = self.slots();
        if let Some((_, slot)) = slots.remove(key) {
            let mut state = slot.lock();
            state.seq += 1;
            state.entry = None;
        }
    }

    /// Drops every entry in constant time.
    pub fn flush(&self) {
        let mut slots = self.slots.write();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *slots = Arc::new(DashMap::new());
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }
}
