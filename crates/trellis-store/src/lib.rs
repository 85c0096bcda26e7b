//! # Trellis Store
//!
//! Storage seam for Trellis links. Provides the [`Store`] trait through which
//! links read the local replica's clock, deduplicate incoming states, persist
//! them, and observe newly accepted states.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait links depend on
//! - [`MemoryStore`] - In-memory implementation
//! - [`StateChange`] - Notification broadcast for every accepted state
//! - [`SaveResult`] - Result of saving a state
//!
//! ## Design Notes
//!
//! - **Idempotent saves**: saving under an existing clock returns `AlreadyExists`
//!   and leaves the stored state untouched
//! - **Latest clock**: the merge of every clock the store has accepted

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use traits::{SaveResult, StateChange, Store};
