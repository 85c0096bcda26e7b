//! Store trait: the interface links use to read and persist replicated state.
//!
//! The state itself is opaque here. A CRDT layer above Trellis decides what
//! the bytes mean and how concurrent states merge; the store only indexes
//! them by vector clock and announces every accepted state.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use trellis_core::VectorClock;

use crate::error::Result;

/// A state accepted by the store, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Clock the state was saved under.
    pub clock: VectorClock,
    /// Opaque serialized state.
    pub state: Bytes,
}

/// Result of saving a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    /// The state was new and has been stored.
    Saved,
    /// A state already exists under this clock; nothing was written.
    AlreadyExists,
}

/// Async interface for the replicated-state store.
///
/// # Concurrency
///
/// Any number of links call into one store concurrently. Each method must be
/// individually atomic: a `contains` racing a `save_state` for the same clock
/// sees either the state before or after the save, never a partial write.
#[async_trait]
pub trait Store: Send + Sync {
    /// The clock of the most recent knowledge held by this replica.
    async fn get_latest_clock(&self) -> Result<VectorClock>;

    /// Whether a state is stored under exactly `clock`.
    async fn contains(&self, clock: &VectorClock) -> Result<bool>;

    /// Persist `state` under `clock`.
    ///
    /// Every `Saved` result is followed by a [`StateChange`] on the
    /// subscription channel.
    async fn save_state(&self, clock: VectorClock, state: Bytes) -> Result<SaveResult>;

    /// Subscribe to accepted states.
    ///
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<StateChange>;
}
