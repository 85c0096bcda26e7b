//! # Trellis Link
//!
//! Causal gossip over one connection. A node that dials a peer runs the
//! Sender role and pushes its local state; a node that accepts runs the
//! Receiver role and persists what arrives.
//!
//! ## Overview
//!
//! Peers exchange vector clocks and state snapshots:
//!
//! 1. The Receiver announces its latest clock when the link opens and again
//!    on every change to its store
//! 2. The Sender pushes each local change the remote does not already have
//! 3. The Receiver persists pushes in arrival order and answers redundant
//!    ones with `Prune`, after which the Sender only announces clocks
//!
//! ## Key Types
//!
//! - [`LinkMessage`] - Wire messages
//! - [`Connection`] - Duplex frame channel between two peers
//! - [`Transport`] - Opens and accepts connections
//! - [`Protocol`] - Attaches roles to connections and reports link events
//! - [`SenderState`] - Sender flow control
//!
//! ## Design Notes
//!
//! - **No retries**: a failed link just ends; the topology layer redials
//! - **Single writer**: each Receiver persists through one FIFO worker

pub mod connection;
pub mod error;
pub mod link;
pub mod messages;
pub mod protocol;
pub mod transport;

pub use connection::{Connection, ConnectionCloser, FrameSink, FrameStream};
pub use error::{LinkError, Result};
pub use link::{run_receiver, run_sender, Role, SenderState};
pub use messages::{limits, protocol_name, LinkMessage, PROTOCOL_NAMESPACE};
pub use protocol::{LinkId, Protocol, ProtocolEvent};
pub use transport::{ConnectionHandler, Transport};
