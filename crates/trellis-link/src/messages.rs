//! Link protocol message types and their wire encoding.
//!
//! Each message travels as one frame holding the CBOR encoding of
//! [`LinkMessage`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use trellis_core::VectorClock;

use crate::error::{LinkError, Result};

/// Namespace prefix for every Trellis protocol name.
pub const PROTOCOL_NAMESPACE: &str = "/trellis";

/// Protocol name routing connections for one collaboration.
pub fn protocol_name(collaboration: &str) -> String {
    format!("{}/collab/{}", PROTOCOL_NAMESPACE, collaboration)
}

/// Message size limits.
pub mod limits {
    /// Max encoded frame size.
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
    /// Max actors in a single clock.
    pub const MAX_CLOCK_ACTORS: usize = 4096;
}

/// Link protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMessage {
    /// My state is now at this clock. No payload.
    Announce {
        /// The sender's current clock.
        clock: VectorClock,
    },

    /// Full state snapshot at a clock.
    Push {
        /// Clock the state corresponds to.
        clock: VectorClock,
        /// Opaque serialized state.
        state: Bytes,
    },

    /// The last snapshot was redundant; stop sending snapshots.
    Prune,

    /// Start sending snapshots again.
    Resume,
}

impl LinkMessage {
    /// The clock carried by this message, if any.
    pub fn clock(&self) -> Option<&VectorClock> {
        match self {
            LinkMessage::Announce { clock } | LinkMessage::Push { clock, .. } => Some(clock),
            LinkMessage::Prune | LinkMessage::Resume => None,
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        if let Some(clock) = self.clock() {
            if clock.len() > limits::MAX_CLOCK_ACTORS {
                return Err("too many actors in clock");
            }
        }
        Ok(())
    }

    /// Encode into a single frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| LinkError::Encode(e.to_string()))?;
        if buf.len() > limits::MAX_FRAME_BYTES {
            return Err(LinkError::FrameTooLarge {
                size: buf.len(),
                max: limits::MAX_FRAME_BYTES,
            });
        }
        Ok(Bytes::from(buf))
    }

    /// Decode a frame. Anything malformed or over the limits is an error.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() > limits::MAX_FRAME_BYTES {
            return Err(LinkError::FrameTooLarge {
                size: frame.len(),
                max: limits::MAX_FRAME_BYTES,
            });
        }
        let message: Self =
            ciborium::from_reader(frame).map_err(|e| LinkError::Decode(e.to_string()))?;
        message
            .validate_limits()
            .map_err(|e| LinkError::InvalidMessage(e.into()))?;
        Ok(message)
    }
}
