//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use trellis::link::transport::memory::{MemoryNetwork, MemoryTransport};
use trellis::{MembershipRing, MemoryRing, TargetSetFn, TopologyConfig, TopologyManager};
use trellis_core::{Keypair, PeerInfo};
use trellis_store::MemoryStore;

use crate::recording::RecordingTransport;

/// Collaboration name used by fixtures.
pub const COLLABORATION: &str = "test-collab";

/// Timing and threshold options for a test node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub debounce: Duration,
    pub interval: Duration,
    pub max_unreachable: u32,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            interval: Duration::from_secs(1),
            max_unreachable: 3,
        }
    }
}

/// One node on an in-memory network, with its own store and ring.
pub struct TestNode {
    pub keys: Keypair,
    pub peer: PeerInfo,
    pub store: Arc<MemoryStore>,
    pub ring: Arc<MemoryRing>,
    pub transport: Arc<RecordingTransport<MemoryTransport>>,
    pub manager: TopologyManager,
}

impl TestNode {
    /// Create a node with a deterministic identity derived from `seed`.
    pub fn new(network: &Arc<MemoryNetwork>, seed: u8, options: NodeOptions) -> Self {
        let keys = Keypair::from_seed(&[seed; 32]);
        let peer = PeerInfo::new(keys.peer_id()).with_addr(format!("/memory/{seed}"));
        let store = Arc::new(MemoryStore::new());
        let ring = Arc::new(MemoryRing::new());
        let transport = Arc::new(RecordingTransport::new(network.create_transport(peer.clone())));

        let config = TopologyConfig::builder()
            .debounce_reset_connections(options.debounce)
            .reset_connection_interval(options.interval)
            .max_unreachable_before_eviction(options.max_unreachable)
            .keys(keys.clone())
            .build()
            .expect("fixture config is complete");

        let manager = TopologyManager::new(
            transport.clone(),
            ring.clone(),
            store.clone(),
            COLLABORATION,
            config,
        )
        .expect("fixture keys match transport");

        Self {
            keys,
            peer,
            store,
            ring,
            transport,
            manager,
        }
    }

    /// Actor name this node records local changes under.
    pub fn actor(&self) -> String {
        self.peer.id.to_hex()
    }

    /// Record a local change in this node's store.
    pub fn record(&self, state: &'static [u8]) -> trellis_core::VectorClock {
        self.store
            .record_local(&self.actor(), state)
            .expect("memory store accepts local state")
    }

    pub fn ring_contains(&self, peer: &PeerInfo) -> bool {
        self.ring.contains(&peer.id)
    }
}

/// Create several nodes with distinct identities on one network.
pub fn multi_node_fixtures(network: &Arc<MemoryNetwork>, count: u8, options: NodeOptions) -> Vec<TestNode> {
    (1..=count)
        .map(|seed| TestNode::new(network, seed, options.clone()))
        .collect()
}

/// A target set that ignores the ring.
pub fn fixed_target(peers: impl IntoIterator<Item = PeerInfo>) -> TargetSetFn {
    let peers: HashSet<PeerInfo> = peers.into_iter().collect();
    Arc::new(move |_: &dyn MembershipRing| -> HashSet<PeerInfo> { peers.clone() })
}

/// A target set the test can change while the manager runs.
#[derive(Clone, Default)]
pub struct SwitchableTarget {
    peers: Arc<RwLock<HashSet<PeerInfo>>>,
}

impl SwitchableTarget {
    pub fn new(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        let target = Self::default();
        target.set(peers);
        target
    }

    /// Replace the target set. Takes effect on the next pass.
    pub fn set(&self, peers: impl IntoIterator<Item = PeerInfo>) {
        *self.peers.write().unwrap_or_else(|e| e.into_inner()) = peers.into_iter().collect();
    }

    pub fn target_fn(&self) -> TargetSetFn {
        let peers = Arc::clone(&self.peers);
        Arc::new(move |_: &dyn MembershipRing| -> HashSet<PeerInfo> {
            peers.read().unwrap_or_else(|e| e.into_inner()).clone()
        })
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Uses tokio time, so it cooperates with paused-clock tests.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
