//! Error types for Trellis core primitives.

use thiserror::Error;

/// Errors produced by core primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}
