//! Error types for the link module.

use thiserror::Error;

/// Errors that terminate or reject a link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A frame could not be decoded into a message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Frame exceeds the size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Message decoded but violates protocol limits.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error, including dial failures and remote aborts.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote end of an accepted connection could not be identified.
    #[error("peer info unavailable: {0}")]
    PeerInfoUnavailable(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] trellis_store::StoreError),

    /// A background task of the link panicked or was cancelled.
    #[error("link task failed: {0}")]
    Task(String),

    /// The connection has already been closed.
    #[error("connection closed")]
    Closed,
}

/// Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;
