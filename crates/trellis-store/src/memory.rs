//! In-memory implementation of the Store trait.
//!
//! Used by tests and by embedders that keep state purely in memory. All
//! data is lost when the store is dropped.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use trellis_core::VectorClock;

use crate::error::{Result, StoreError};
use crate::traits::{SaveResult, StateChange, Store};

/// Capacity of the change broadcast before slow subscribers lag.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// In-memory store implementation. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    changes: broadcast::Sender<StateChange>,
}

struct MemoryStoreInner {
    /// States indexed by the clock they were saved under.
    states: HashMap<VectorClock, Bytes>,

    /// Merge of every clock seen so far.
    latest: VectorClock,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(MemoryStoreInner {
                states: HashMap::new(),
                latest: VectorClock::new(),
            }),
            changes,
        }
    }

    /// Record a local mutation made by `actor`.
    ///
    /// Advances the latest clock by one tick for `actor`, stores `state`
    /// under the resulting clock and notifies subscribers.
    pub fn record_local(&self, actor: &str, state: impl Into<Bytes>) -> Result<VectorClock> {
        let state = state.into();
        let clock = {
            let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
            let mut clock = inner.latest.clone();
            clock.increment(actor);
            inner.states.insert(clock.clone(), state.clone());
            inner.latest = clock.clone();
            clock
        };

        tracing::debug!(actor, clock = %clock, "Recorded local state");
        self.notify(clock.clone(), state);
        Ok(clock)
    }

    /// Fetch the state stored under exactly `clock`.
    pub fn get_state(&self, clock: &VectorClock) -> Result<Option<Bytes>> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.states.get(clock).cloned())
    }

    /// Number of stored states.
    pub fn len(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.states.len())
    }

    /// True if nothing has been stored.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn notify(&self, clock: VectorClock, state: Bytes) {
        // No receivers is normal before any link attaches.
        let _ = self.changes.send(StateChange { clock, state });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_latest_clock(&self) -> Result<VectorClock> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.latest.clone())
    }

    async fn contains(&self, clock: &VectorClock) -> Result<bool> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.states.contains_key(clock))
    }

    async fn save_state(&self, clock: VectorClock, state: Bytes) -> Result<SaveResult> {
        {
            let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
            if inner.states.contains_key(&clock) {
                return Ok(SaveResult::AlreadyExists);
            }
            inner.states.insert(clock.clone(), state.clone());
            inner.latest.merge_in(&clock);
        }

        tracing::debug!(clock = %clock, "Saved state");
        self.notify(clock, state);
        Ok(SaveResult::Saved)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}
