//! Peer identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::crypto::Ed25519PublicKey;
use crate::error::CoreError;

/// Domain separator for deriving peer ids from public keys.
const PEER_ID_DOMAIN: &[u8] = b"trellis-peer-id-v0:";

/// A 32-byte opaque peer identifier.
///
/// Derived as Blake3(domain || public_key), so it is globally unique for all
/// practical purposes and stable for the lifetime of the key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the peer id for a public key.
    pub fn from_public_key(key: &Ed25519PublicKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(PEER_ID_DOMAIN);
        hasher.update(key.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidPeerId(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidPeerId("expected 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A peer identity plus the addresses it can be reached at.
///
/// Equality and hashing consider only the [`PeerId`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's identity.
    pub id: PeerId,
    /// Routable addresses, opaque to this crate.
    pub addrs: Vec<String>,
}

impl PeerInfo {
    /// A peer with no known addresses.
    pub fn new(id: PeerId) -> Self {
        Self { id, addrs: Vec::new() }
    }

    /// Add an address.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerInfo {}

impl Hash for PeerInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl From<PeerId> for PeerInfo {
    fn from(id: PeerId) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId::from_bytes([0x42; 32]);
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn test_peer_id_from_hex_rejects_short_input() {
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex("not hex").is_err());
    }

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::from_bytes([0xab; 32]);
        assert_eq!(id.to_string(), "abababababababab");
    }

    #[test]
    fn test_peer_id_depends_on_key() {
        let a = PeerId::from_public_key(&Ed25519PublicKey([1; 32]));
        let b = PeerId::from_public_key(&Ed25519PublicKey([2; 32]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_peer_info_equality_ignores_addrs() {
        let id = PeerId::from_bytes([9; 32]);
        let a = PeerInfo::new(id).with_addr("mem://a");
        let b = PeerInfo::new(id).with_addr("mem://b");
        assert_eq!(a, b);

        let set: HashSet<PeerInfo> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }
}
