//! The topology manager: keeps a node linked to its target peers.
//!
//! One actor task owns all connection bookkeeping. It reacts to link events
//! from the [`Protocol`], to finished dials, and to reconciliation triggers.
//! Triggers come from a periodic ticker, a trailing debounce over ring
//! changes, and explicit [`TopologyManager::reset_connections`] calls; all of
//! them feed one [`Notify`], so a burst collapses into a single pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use trellis_core::{PeerId, PeerInfo, PeerSet, VectorClock};
use trellis_link::{Connection, LinkError, LinkId, Protocol, ProtocolEvent, Role, Transport};
use trellis_store::Store;

use crate::config::TopologyConfig;
use crate::error::{ConfigError, Result, TopologyError};
use crate::ring::{MembershipRing, RingChange, TargetSetFn};

/// Capacity of the topology event broadcast.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by a running manager.
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// A link was attached.
    LinkOpened { peer: PeerInfo, role: Role },
    /// A link ended, with the error that ended it if any.
    LinkClosed {
        peer: PeerInfo,
        role: Role,
        cause: Option<Arc<LinkError>>,
    },
    /// The peer failed to answer too many dials in a row.
    ShouldEvict(PeerInfo),
    /// An inbound connection was dropped before a link could start.
    Error(Arc<LinkError>),
}

/// Peers with a live link, as last published by the actor.
#[derive(Debug, Clone, Default)]
struct ConnectionSnapshot {
    inbound: Vec<PeerInfo>,
    outbound: Vec<PeerInfo>,
}

/// Maintains the outbound links of one collaboration.
pub struct TopologyManager {
    transport: Arc<dyn Transport>,
    ring: Arc<dyn MembershipRing>,
    protocol: Protocol,
    config: TopologyConfig,
    events: broadcast::Sender<TopologyEvent>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    lifecycle: Mutex<Lifecycle>,
}

enum Lifecycle {
    Idle {
        protocol_events: mpsc::UnboundedReceiver<ProtocolEvent>,
        snapshot: watch::Sender<ConnectionSnapshot>,
    },
    Running {
        cancel: CancellationToken,
        trigger: Arc<Notify>,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

impl TopologyManager {
    /// Create a manager for `collaboration`.
    ///
    /// Fails if the configuration is unusable or its keys do not match the
    /// identity of `transport`.
    pub fn new(
        transport: Arc<dyn Transport>,
        ring: Arc<dyn MembershipRing>,
        store: Arc<dyn Store>,
        collaboration: &str,
        config: TopologyConfig,
    ) -> Result<Self> {
        config.validate()?;
        let local = transport.local_peer();
        if config.keys.peer_id() != local.id {
            return Err(ConfigError::Invalid {
                field: "keys",
                reason: format!("keys identify {} but transport is {}", config.keys.peer_id(), local.id),
            }
            .into());
        }

        let (protocol, protocol_events) = Protocol::new(collaboration, store);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(ConnectionSnapshot::default());

        Ok(Self {
            transport,
            ring,
            protocol,
            config,
            events,
            snapshot,
            lifecycle: Mutex::new(Lifecycle::Idle {
                protocol_events,
                snapshot: snapshot_tx,
            }),
        })
    }

    /// Start accepting links and maintaining outbound links to `target`.
    pub async fn start(&self, target: TargetSetFn) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let (protocol_events, snapshot) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle {
                protocol_events,
                snapshot,
            } => (protocol_events, snapshot),
            running @ Lifecycle::Running { .. } => {
                *lifecycle = running;
                return Err(TopologyError::AlreadyStarted);
            }
            Lifecycle::Stopped => return Err(TopologyError::Stopped),
        };

        if let Err(e) = self
            .transport
            .handle(self.protocol.name(), self.protocol.handler())
            .await
        {
            *lifecycle = Lifecycle::Idle {
                protocol_events,
                snapshot,
            };
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        let ring_changes = self.ring.subscribe();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            transport: Arc::clone(&self.transport),
            ring: Arc::clone(&self.ring),
            protocol: self.protocol.clone(),
            local: self.transport.local_peer().id,
            target,
            max_unreachable: self.config.max_unreachable_before_eviction,
            events: self.events.clone(),
            snapshot,
            inbound: PeerSet::new(),
            outbound: PeerSet::new(),
            unreachable: HashMap::new(),
            dialing: HashSet::new(),
            dial_tx,
        };

        let tasks = vec![
            tokio::spawn(actor.run(protocol_events, dial_rx, Arc::clone(&trigger), cancel.clone())),
            tokio::spawn(tick(
                self.config.reset_connection_interval,
                Arc::clone(&trigger),
                cancel.clone(),
            )),
            tokio::spawn(debounce(
                ring_changes,
                self.config.debounce_reset_connections,
                Arc::clone(&trigger),
                cancel.clone(),
            )),
        ];

        tracing::info!(
            peer = %self.local_peer_id(),
            protocol = %self.protocol.name(),
            "Topology manager started"
        );
        *lifecycle = Lifecycle::Running {
            cancel,
            trigger,
            tasks,
        };
        Ok(())
    }

    /// Stop reconciling and stop accepting links. Idempotent.
    ///
    /// Links that are already open keep running until their connections
    /// close. No reconciliation pass starts after this returns.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Running { cancel, tasks, .. } =
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        else {
            return;
        };

        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Topology task ended abnormally");
            }
        }
        if let Err(e) = self.transport.unhandle(self.protocol.name()).await {
            tracing::warn!(protocol = %self.protocol.name(), error = %e, "Failed to unregister handler");
        }
        tracing::info!(protocol = %self.protocol.name(), "Topology manager stopped");
    }

    /// Request a reconciliation pass now. Coalesced with pending passes.
    pub async fn reset_connections(&self) -> Result<()> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running { trigger, .. } => {
                trigger.notify_one();
                Ok(())
            }
            Lifecycle::Idle { .. } => Err(TopologyError::NotStarted),
            Lifecycle::Stopped => Err(TopologyError::Stopped),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn inbound_connection_count(&self) -> usize {
        self.snapshot.borrow().inbound.len()
    }

    pub fn inbound_connected_peers(&self) -> Vec<PeerInfo> {
        self.snapshot.borrow().inbound.clone()
    }

    pub fn outbound_connection_count(&self) -> usize {
        self.snapshot.borrow().outbound.len()
    }

    pub fn outbound_connected_peers(&self) -> Vec<PeerInfo> {
        self.snapshot.borrow().outbound.clone()
    }

    /// What the outbound link to `peer` knows of the peer's state.
    pub fn vector_clock(&self, peer: &PeerId) -> Option<VectorClock> {
        self.protocol.vector_clock(peer)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.config.keys.peer_id()
    }

    pub fn protocol_name(&self) -> &str {
        self.protocol.name()
    }

    /// Subscribe to topology events.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }
}

impl Drop for TopologyManager {
    /// Ends the background tasks. The protocol handler stays registered until
    /// the transport drops it; call [`TopologyManager::stop`] to remove it.
    fn drop(&mut self) {
        if let Lifecycle::Running { cancel, .. } = self.lifecycle.get_mut() {
            cancel.cancel();
        }
    }
}

/// Result of a dial attempt, reported back to the actor.
enum DialOutcome {
    Connected(PeerInfo, Connection),
    Failed(PeerInfo, LinkError),
}

/// Owns all topology state while the manager runs.
struct Actor {
    transport: Arc<dyn Transport>,
    ring: Arc<dyn MembershipRing>,
    protocol: Protocol,
    local: PeerId,
    target: TargetSetFn,
    max_unreachable: u32,
    events: broadcast::Sender<TopologyEvent>,
    snapshot: watch::Sender<ConnectionSnapshot>,
    inbound: PeerSet<LinkId>,
    outbound: PeerSet<LinkId>,
    /// Consecutive dial failures per peer.
    unreachable: HashMap<PeerId, u32>,
    /// Peers with a dial in flight.
    dialing: HashSet<PeerId>,
    dial_tx: mpsc::UnboundedSender<DialOutcome>,
}

impl Actor {
    async fn run(
        mut self,
        mut protocol_events: mpsc::UnboundedReceiver<ProtocolEvent>,
        mut dials: mpsc::UnboundedReceiver<DialOutcome>,
        trigger: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(event) = protocol_events.recv() => self.on_protocol_event(event),
                Some(outcome) = dials.recv() => self.on_dial_outcome(outcome),
                _ = trigger.notified() => self.reconcile(),
            }
        }
        tracing::debug!(peer = %self.local, "Topology actor exited");
    }

    /// One reconciliation pass.
    fn reconcile(&mut self) {
        let target: HashMap<PeerId, PeerInfo> = (self.target)(self.ring.as_ref())
            .into_iter()
            .filter(|peer| peer.id != self.local)
            .map(|peer| (peer.id, peer))
            .collect();
        tracing::debug!(
            target = target.len(),
            outbound = self.outbound.len(),
            dialing = self.dialing.len(),
            "Reconciling connections"
        );

        for peer in target.values() {
            if self.outbound.contains(&peer.id) || self.dialing.contains(&peer.id) {
                continue;
            }
            self.dial(peer.clone());
        }

        let stale: Vec<PeerInfo> = self
            .outbound
            .peers()
            .filter(|peer| !target.contains_key(&peer.id))
            .cloned()
            .collect();
        for peer in stale {
            self.outbound.remove(&peer.id);
            self.unreachable.remove(&peer.id);
            self.hang_up(peer);
        }

        self.publish();
    }

    fn dial(&mut self, peer: PeerInfo) {
        self.dialing.insert(peer.id);
        let transport = Arc::clone(&self.transport);
        let protocol = self.protocol.name().to_string();
        let outcomes = self.dial_tx.clone();

        tokio::spawn(async move {
            tracing::debug!(peer = %peer.id, protocol = %protocol, "Dialing");
            let outcome = match transport.connect(&peer, &protocol).await {
                Ok(connection) => DialOutcome::Connected(peer, connection),
                Err(e) => DialOutcome::Failed(peer, e),
            };
            // The actor is gone once the manager stopped.
            let _ = outcomes.send(outcome);
        });
    }

    fn hang_up(&self, peer: PeerInfo) {
        let transport = Arc::clone(&self.transport);
        let protocol = self.protocol.name().to_string();

        tokio::spawn(async move {
            tracing::debug!(peer = %peer.id, protocol = %protocol, "Hanging up");
            if let Err(e) = transport.disconnect(&peer, &protocol).await {
                tracing::warn!(peer = %peer.id, error = %e, "Failed to disconnect");
            }
        });
    }

    fn on_dial_outcome(&mut self, outcome: DialOutcome) {
        match outcome {
            DialOutcome::Connected(peer, connection) => {
                self.dialing.remove(&peer.id);
                self.unreachable.remove(&peer.id);
                let link = self.protocol.dialer_for(peer.clone(), connection);
                self.outbound.insert(peer, link);
                self.publish();
            }
            DialOutcome::Failed(peer, e) => {
                self.dialing.remove(&peer.id);
                tracing::warn!(peer = %peer.id, error = %e, "Failed to connect");
                self.ring.remove(&peer.id);
                self.peer_unreachable(peer);
            }
        }
    }

    fn peer_unreachable(&mut self, peer: PeerInfo) {
        let count = self.unreachable.entry(peer.id).or_insert(0);
        *count += 1;
        if *count >= self.max_unreachable {
            self.unreachable.remove(&peer.id);
            tracing::warn!(peer = %peer.id, "Peer unreachable, should evict");
            self.emit(TopologyEvent::ShouldEvict(peer));
        }
    }

    fn on_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::InboundOpened { peer, link } => {
                self.inbound.insert(peer.clone(), link);
                self.ring.add(peer.clone());
                self.emit(TopologyEvent::LinkOpened {
                    peer,
                    role: Role::Receiver,
                });
            }
            ProtocolEvent::OutboundOpened { peer, link } => {
                self.outbound.insert(peer.clone(), link);
                self.emit(TopologyEvent::LinkOpened {
                    peer,
                    role: Role::Sender,
                });
            }
            ProtocolEvent::InboundClosed { peer, link, cause } => {
                if self.is_current(&self.inbound, &peer.id, link) {
                    self.inbound.remove(&peer.id);
                    if !self.outbound.contains(&peer.id) {
                        self.ring.remove(&peer.id);
                    }
                }
                self.emit(TopologyEvent::LinkClosed {
                    peer,
                    role: Role::Receiver,
                    cause: cause.map(Arc::new),
                });
            }
            ProtocolEvent::OutboundClosed { peer, link, cause } => {
                if self.is_current(&self.outbound, &peer.id, link) {
                    self.outbound.remove(&peer.id);
                    if !self.inbound.contains(&peer.id) {
                        self.ring.remove(&peer.id);
                    }
                }
                self.emit(TopologyEvent::LinkClosed {
                    peer,
                    role: Role::Sender,
                    cause: cause.map(Arc::new),
                });
            }
            ProtocolEvent::Error(e) => self.emit(TopologyEvent::Error(Arc::new(e))),
        }
        self.publish();
    }

    /// Whether a closing `link` still owns its entry in `links`.
    ///
    /// False only when a newer link to the peer has replaced it. A link whose
    /// entry was already dropped by a hang-up still counts as current.
    fn is_current(&self, links: &PeerSet<LinkId>, peer: &PeerId, link: LinkId) -> bool {
        links.get(peer).map_or(true, |(_, current)| *current == link)
    }

    fn emit(&self, event: TopologyEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(ConnectionSnapshot {
            inbound: self.inbound.peers().cloned().collect(),
            outbound: self.outbound.peers().cloned().collect(),
        });
    }
}

/// Periodic reconciliation. The first pass comes one full period after start.
async fn tick(period: Duration, trigger: Arc<Notify>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => trigger.notify_one(),
        }
    }
}

/// Trailing debounce over ring changes.
async fn debounce(
    mut changes: broadcast::Receiver<RingChange>,
    delay: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            change = changes.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = change {
                    return;
                }
            }
        }

        // Restart the quiet period on every further change.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => break,
                change = changes.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = change {
                        break;
                    }
                }
            }
        }

        tracing::trace!("Ring settled, requesting reconciliation");
        trigger.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{all_members, MemoryRing};
    use trellis_core::Keypair;
    use trellis_link::transport::memory::MemoryNetwork;
    use trellis_store::MemoryStore;

    fn fixed_target() -> TargetSetFn {
        Arc::new(|_: &dyn MembershipRing| -> HashSet<PeerInfo> { HashSet::new() })
    }

    fn config(keys: Keypair) -> TopologyConfig {
        TopologyConfig::builder()
            .debounce_reset_connections(Duration::from_millis(50))
            .reset_connection_interval(Duration::from_secs(1))
            .max_unreachable_before_eviction(2)
            .keys(keys)
            .build()
            .unwrap()
    }

    fn manager(network: &Arc<MemoryNetwork>, seed: u8) -> TopologyManager {
        let keys = Keypair::from_seed(&[seed; 32]);
        let transport = network.create_transport(PeerInfo::new(keys.peer_id()));
        TopologyManager::new(
            Arc::new(transport),
            Arc::new(MemoryRing::new()),
            Arc::new(MemoryStore::new()),
            "unit",
            config(keys),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_keys_must_match_transport() {
        let network = MemoryNetwork::new();
        let transport = network.create_transport(PeerInfo::new(Keypair::from_seed(&[1; 32]).peer_id()));

        let result = TopologyManager::new(
            Arc::new(transport),
            Arc::new(MemoryRing::new()),
            Arc::new(MemoryStore::new()),
            "unit",
            config(Keypair::from_seed(&[2; 32])),
        );
        assert!(matches!(
            result,
            Err(TopologyError::Config(ConfigError::Invalid { field: "keys", .. }))
        ));
    }

    #[tokio::test]
    async fn test_accessors_before_start() {
        let network = MemoryNetwork::new();
        let manager = manager(&network, 1);

        assert_eq!(manager.protocol_name(), "/trellis/collab/unit");
        assert_eq!(manager.local_peer_id(), Keypair::from_seed(&[1; 32]).peer_id());
        assert_eq!(manager.inbound_connection_count(), 0);
        assert_eq!(manager.outbound_connection_count(), 0);
        assert!(manager.outbound_connected_peers().is_empty());
        assert!(matches!(manager.reset_connections().await, Err(TopologyError::NotStarted)));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let network = MemoryNetwork::new();
        let manager = manager(&network, 1);

        manager.start(all_members()).await.unwrap();
        assert!(matches!(manager.start(all_members()).await, Err(TopologyError::AlreadyStarted)));
        manager.reset_connections().await.unwrap();

        manager.stop().await;
        manager.stop().await;
        assert!(matches!(manager.start(all_members()).await, Err(TopologyError::Stopped)));
    }

    async fn next_close(events: &mut broadcast::Receiver<TopologyEvent>) -> Role {
        loop {
            if let Ok(TopologyEvent::LinkClosed { role, .. }) = events.recv().await {
                return role;
            }
        }
    }

    #[tokio::test]
    async fn test_stale_inbound_close_keeps_newer_link() {
        let network = MemoryNetwork::new();
        let manager = manager(&network, 1);
        let local = PeerInfo::new(manager.local_peer_id());
        let remote = PeerInfo::new(Keypair::from_seed(&[2; 32]).peer_id());
        let mut events = manager.subscribe();
        manager.start(fixed_target()).await.unwrap();

        let (first, _first_remote, first_closer) = Connection::pair(local.clone(), remote.clone());
        let (second, _second_remote, second_closer) = Connection::pair(local, remote.clone());
        manager.protocol.accept(first);
        manager.protocol.accept(second);

        let mut snapshot = manager.snapshot.clone();
        snapshot.wait_for(|s| s.inbound.len() == 1).await.unwrap();
        assert!(manager.ring.contains(&remote.id));

        first_closer.close();
        assert_eq!(next_close(&mut events).await, Role::Receiver);
        assert_eq!(manager.inbound_connection_count(), 1);
        assert!(manager.ring.contains(&remote.id));

        second_closer.close();
        assert_eq!(next_close(&mut events).await, Role::Receiver);
        snapshot.wait_for(|s| s.inbound.is_empty()).await.unwrap();
        assert!(!manager.ring.contains(&remote.id));
    }

    #[tokio::test]
    async fn test_drop_ends_background_tasks() {
        let network = MemoryNetwork::new();
        let keys = Keypair::from_seed(&[1; 32]);
        let transport = Arc::new(network.create_transport(PeerInfo::new(keys.peer_id())));
        let manager = TopologyManager::new(
            transport.clone(),
            Arc::new(MemoryRing::new()),
            Arc::new(MemoryStore::new()),
            "unit",
            config(keys),
        )
        .unwrap();
        manager.start(all_members()).await.unwrap();
        assert!(Arc::strong_count(&transport) > 2);

        drop(manager);
        // Only the test's handle survives once the actor has exited.
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&transport) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("actor still holds the transport");
    }

    #[tokio::test]
    async fn test_stop_unregisters_handler() {
        let network = MemoryNetwork::new();
        let manager = manager(&network, 1);
        let dialer = network.create_transport(PeerInfo::new(Keypair::from_seed(&[2; 32]).peer_id()));
        let local = PeerInfo::new(manager.local_peer_id());

        manager.start(all_members()).await.unwrap();
        assert!(dialer.connect(&local, manager.protocol_name()).await.is_ok());

        manager.stop().await;
        assert!(dialer.connect(&local, manager.protocol_name()).await.is_err());
    }
}
