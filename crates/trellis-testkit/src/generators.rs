//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use trellis_core::{Keypair, PeerId, PeerInfo, VectorClock};
use trellis_link::LinkMessage;
use trellis_store::StateChange;

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random PeerId.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(PeerId::from)
}

/// Generate a PeerInfo with up to two addresses.
pub fn peer_info() -> impl Strategy<Value = PeerInfo> {
    (peer_id(), prop::collection::vec("/memory/[0-9]{1,4}", 0..=2)).prop_map(|(id, addrs)| {
        addrs
            .into_iter()
            .fold(PeerInfo::new(id), |info, addr| info.with_addr(addr))
    })
}

/// Generate an actor name from a small pool, so clocks overlap.
pub fn actor() -> impl Strategy<Value = String> {
    "[a-e]"
}

/// Generate a vector clock over the small actor pool.
pub fn vector_clock() -> impl Strategy<Value = VectorClock> {
    prop::collection::btree_map(actor(), 0u64..8, 0..5)
        .prop_map(|entries: BTreeMap<String, u64>| VectorClock::from(entries))
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(Bytes::from)
}

/// Generate a store change notification.
pub fn state_change() -> impl Strategy<Value = StateChange> {
    (vector_clock(), payload(64)).prop_map(|(clock, state)| StateChange { clock, state })
}

/// Generate any link message.
pub fn link_message() -> impl Strategy<Value = LinkMessage> {
    prop_oneof![
        vector_clock().prop_map(|clock| LinkMessage::Announce { clock }),
        (vector_clock(), payload(256)).prop_map(|(clock, state)| LinkMessage::Push { clock, state }),
        Just(LinkMessage::Prune),
        Just(LinkMessage::Resume),
    ]
}
