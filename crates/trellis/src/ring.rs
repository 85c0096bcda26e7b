//! Membership ring seam.
//!
//! The ring holds every peer currently known to take part in a
//! collaboration. Which of them a node stays connected to is decided by a
//! [`TargetSetFn`] over the ring, supplied when the manager starts.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use trellis_core::{PeerId, PeerInfo, PeerSet};

/// Capacity of the ring change broadcast.
const RING_CHANNEL_CAPACITY: usize = 256;

/// A change in ring membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingChange {
    Added(PeerInfo),
    Removed(PeerId),
}

/// Membership ring of a collaboration.
pub trait MembershipRing: Send + Sync {
    /// Add a peer. Returns false if it was already present.
    fn add(&self, peer: PeerInfo) -> bool;

    /// Remove a peer. Returns false if it was absent.
    fn remove(&self, peer: &PeerId) -> bool;

    /// True if `peer` is in the ring.
    fn contains(&self, peer: &PeerId) -> bool;

    /// Snapshot of the current members.
    fn peers(&self) -> Vec<PeerInfo>;

    /// Notifications for every membership change.
    fn subscribe(&self) -> broadcast::Receiver<RingChange>;
}

/// Chooses the peers a node should hold outbound links to.
pub type TargetSetFn = Arc<dyn Fn(&dyn MembershipRing) -> HashSet<PeerInfo> + Send + Sync>;

/// Target every member of the ring.
pub fn all_members() -> TargetSetFn {
    Arc::new(|ring: &dyn MembershipRing| -> HashSet<PeerInfo> { ring.peers().into_iter().collect() })
}

/// In-memory membership ring.
pub struct MemoryRing {
    members: RwLock<PeerSet>,
    changes: broadcast::Sender<RingChange>,
}

impl MemoryRing {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(RING_CHANNEL_CAPACITY);
        Self {
            members: RwLock::new(PeerSet::new()),
            changes,
        }
    }

    pub fn len(&self) -> usize {
        self.read(|members| members.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&PeerSet) -> T) -> T {
        // Membership stays consistent even if a writer panicked mid-call.
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        f(&members)
    }

    fn write<T>(&self, f: impl FnOnce(&mut PeerSet) -> T) -> T {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        f(&mut members)
    }

    fn notify(&self, change: RingChange) {
        tracing::trace!(?change, "Ring changed");
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<PeerInfo> for MemoryRing {
    fn from_iter<I: IntoIterator<Item = PeerInfo>>(iter: I) -> Self {
        let ring = Self::new();
        ring.write(|members| {
            for peer in iter {
                members.add(peer);
            }
        });
        ring
    }
}

impl MembershipRing for MemoryRing {
    fn add(&self, peer: PeerInfo) -> bool {
        let added = self.write(|members| members.add(peer.clone()));
        if added {
            self.notify(RingChange::Added(peer));
        }
        added
    }

    fn remove(&self, peer: &PeerId) -> bool {
        let removed = self.write(|members| members.remove(peer).is_some());
        if removed {
            self.notify(RingChange::Removed(*peer));
        }
        removed
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.read(|members| members.contains(peer))
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.read(|members| members.peers().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<RingChange> {
        self.changes.subscribe()
    }
}
