//! # Trellis Testkit
//!
//! Testing utilities for Trellis.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: ready-made nodes on an in-memory network, and
//!   target-set helpers
//! - **Recording transport**: counts dials and hang-ups so tests can assert
//!   on exactly what a manager did
//! - **Generators**: Proptest strategies for clocks, peers and messages
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use trellis::link::transport::memory::MemoryNetwork;
//! use trellis_testkit::fixtures::{fixed_target, NodeOptions, TestNode};
//!
//! async fn example() {
//!     let network = MemoryNetwork::new();
//!     let a = TestNode::new(&network, 1, NodeOptions::default());
//!     let b = TestNode::new(&network, 2, NodeOptions::default());
//!
//!     b.manager.start(fixed_target([])).await.unwrap();
//!     a.manager.start(fixed_target([b.peer.clone()])).await.unwrap();
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use trellis_testkit::generators::vector_clock;
//!
//! proptest! {
//!     #[test]
//!     fn merge_is_idempotent(a in vector_clock()) {
//!         prop_assert_eq!(a.merge(&a), a);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod recording;

pub use fixtures::{
    eventually, fixed_target, init_tracing, multi_node_fixtures, NodeOptions, SwitchableTarget,
    TestNode,
};
pub use recording::RecordingTransport;
