//! # Trellis
//!
//! Topology maintenance and causal gossip replication for peer-to-peer
//! collaborations.
//!
//! ## Overview
//!
//! Every node holds a replica of a collaboration's shared state. Trellis
//! keeps each node directly linked to a target subset of the known peers and
//! moves state along those links:
//!
//! - **Topology**: a [`TopologyManager`] dials every peer the target-set
//!   function picks from the membership ring, hangs up on peers that drop
//!   out of it, and flags peers that keep failing to answer for eviction
//! - **Gossip**: each dialed link pushes local state changes the remote does
//!   not have yet, using vector clocks to skip redundant transfers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use trellis::core::{Keypair, PeerInfo};
//! use trellis::link::transport::memory::MemoryNetwork;
//! use trellis::store::MemoryStore;
//! use trellis::{all_members, MemoryRing, TopologyConfig, TopologyManager};
//!
//! async fn example() -> trellis::Result<()> {
//!     let keys = Keypair::generate();
//!     let network = MemoryNetwork::new();
//!     let transport = network.create_transport(PeerInfo::new(keys.peer_id()));
//!
//!     let config = TopologyConfig::builder()
//!         .debounce_reset_connections(Duration::from_millis(500))
//!         .reset_connection_interval(Duration::from_secs(6))
//!         .max_unreachable_before_eviction(3)
//!         .keys(keys)
//!         .build()?;
//!
//!     let manager = TopologyManager::new(
//!         Arc::new(transport),
//!         Arc::new(MemoryRing::new()),
//!         Arc::new(MemoryStore::new()),
//!         "my-collaboration",
//!         config,
//!     )?;
//!
//!     manager.start(all_members()).await?;
//!     // ...
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `trellis::core` - Vector clocks and peer identity
//! - `trellis::store` - State store seam
//! - `trellis::link` - Link protocol and transport seam

pub mod config;
pub mod error;
pub mod ring;
pub mod topology;

// Re-export component crates
pub use trellis_core as core;
pub use trellis_link as link;
pub use trellis_store as store;

pub use config::{TopologyConfig, TopologyConfigBuilder};
pub use error::{ConfigError, Result, TopologyError};
pub use ring::{all_members, MembershipRing, MemoryRing, RingChange, TargetSetFn};
pub use topology::{TopologyEvent, TopologyManager};

// Re-export commonly used types
pub use trellis_core::{ClockOrdering, Keypair, PeerId, PeerInfo, VectorClock};
pub use trellis_link::{LinkError, Role, Transport};
pub use trellis_store::{MemoryStore, StateChange, Store};
