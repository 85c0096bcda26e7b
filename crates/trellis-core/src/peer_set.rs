//! A keyed set of peers.

use std::collections::BTreeMap;

use crate::peer::{PeerId, PeerInfo};

/// Peers keyed by identity, each carrying an associated handle.
///
/// At most one entry exists per [`PeerId`]. Iteration follows id order, so
/// it is stable regardless of insertion order.
#[derive(Debug, Clone)]
pub struct PeerSet<H = ()> {
    entries: BTreeMap<PeerId, (PeerInfo, H)>,
}

impl<H> PeerSet<H> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert a peer with its handle, replacing any previous entry.
    ///
    /// Returns the handle that was replaced, if any.
    pub fn insert(&mut self, peer: PeerInfo, handle: H) -> Option<H> {
        self.entries
            .insert(peer.id, (peer, handle))
            .map(|(_, old)| old)
    }

    /// Remove a peer, returning its info and handle.
    pub fn remove(&mut self, id: &PeerId) -> Option<(PeerInfo, H)> {
        self.entries.remove(id)
    }

    /// Check membership.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.entries.contains_key(id)
    }

    /// Look up a peer's info and handle.
    pub fn get(&self, id: &PeerId) -> Option<(&PeerInfo, &H)> {
        self.entries.get(id).map(|(info, handle)| (info, handle))
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no peers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate peer infos.
    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.entries.values().map(|(info, _)| info)
    }

    /// Iterate peer ids.
    pub fn ids(&self) -> impl Iterator<Item = &PeerId> {
        self.entries.keys()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl PeerSet<()> {
    /// Insert a peer without a handle. Returns true if it was new.
    pub fn add(&mut self, peer: PeerInfo) -> bool {
        self.insert(peer, ()).is_none()
    }
}

impl<H> Default for PeerSet<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<PeerInfo> for PeerSet<()> {
    fn from_iter<I: IntoIterator<Item = PeerInfo>>(iter: I) -> Self {
        let mut set = Self::new();
        for peer in iter {
            set.add(peer);
        }
        set
    }
}
