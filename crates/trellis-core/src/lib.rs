//! # Trellis Core
//!
//! Pure primitives for Trellis: causal clocks and peer identities.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`VectorClock`] - Per-actor counters used to order state causally
//! - [`ClockOrdering`] - Result of comparing two clocks
//! - [`PeerId`] / [`PeerInfo`] - Peer identity and reachability info
//! - [`PeerSet`] - Keyed set of peers with per-peer handles
//! - [`Keypair`] - The local node's Ed25519 key pair

pub mod clock;
pub mod crypto;
pub mod error;
pub mod peer;
pub mod peer_set;

pub use clock::{ClockOrdering, VectorClock};
pub use crypto::{Ed25519PublicKey, Keypair};
pub use error::CoreError;
pub use peer::{PeerId, PeerInfo};
pub use peer_set::PeerSet;
