//! Error types for the topology layer.

use thiserror::Error;
use trellis_link::LinkError;

/// Configuration problems, reported when a manager is constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("missing required option: {0}")]
    Missing(&'static str),

    /// A field was provided with an unusable value.
    #[error("invalid option {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The configuration document could not be parsed.
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors that can occur during topology operations.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Link or transport error.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// `start` was called on a running manager.
    #[error("topology manager already started")]
    AlreadyStarted,

    /// The manager has not been started.
    #[error("topology manager not started")]
    NotStarted,

    /// The manager was stopped and cannot be started again.
    #[error("topology manager stopped")]
    Stopped,
}

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;
