//! Per-collaboration protocol dispatcher.
//!
//! Accepts inbound connections as Receivers, attaches dialed connections as
//! Senders, and reports every link opening and closing to its owner.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use trellis_core::{PeerId, PeerInfo, VectorClock};
use trellis_store::Store;

use crate::connection::Connection;
use crate::error::LinkError;
use crate::link::{run_receiver, run_sender, Role};
use crate::messages::protocol_name;
use crate::transport::ConnectionHandler;

/// Identifies one link for its whole lifetime. Never reused by a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Link lifecycle events reported to the protocol's owner.
#[derive(Debug)]
pub enum ProtocolEvent {
    /// A Receiver link was attached to an accepted connection.
    InboundOpened { peer: PeerInfo, link: LinkId },
    /// A Receiver link ended.
    InboundClosed {
        peer: PeerInfo,
        link: LinkId,
        cause: Option<LinkError>,
    },
    /// A Sender link was attached to a dialed connection.
    OutboundOpened { peer: PeerInfo, link: LinkId },
    /// A Sender link ended.
    OutboundClosed {
        peer: PeerInfo,
        link: LinkId,
        cause: Option<LinkError>,
    },
    /// A connection was abandoned before a link could start.
    Error(LinkError),
}

impl ProtocolEvent {
    fn closed(role: Role, peer: PeerInfo, link: LinkId, cause: Option<LinkError>) -> Self {
        match role {
            Role::Sender => ProtocolEvent::OutboundClosed { peer, link, cause },
            Role::Receiver => ProtocolEvent::InboundClosed { peer, link, cause },
        }
    }
}

/// Protocol instance for one collaboration. Cheap to clone.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

struct ProtocolInner {
    name: String,
    store: Arc<dyn Store>,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    next_link: AtomicU64,
    /// Remote clocks published by live Sender links.
    remote_clocks: RwLock<HashMap<PeerId, watch::Receiver<VectorClock>>>,
}

impl Protocol {
    /// Create the protocol for `collaboration` along with its event feed.
    pub fn new(
        collaboration: &str,
        store: Arc<dyn Store>,
    ) -> (Self, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let protocol = Self {
            inner: Arc::new(ProtocolInner {
                name: protocol_name(collaboration),
                store,
                events,
                next_link: AtomicU64::new(1),
                remote_clocks: RwLock::new(HashMap::new()),
            }),
        };
        (protocol, rx)
    }

    /// Protocol name used to route connections.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Connection handler to register with the transport.
    pub fn handler(&self) -> ConnectionHandler {
        let protocol = self.clone();
        Arc::new(move |connection| protocol.accept(connection))
    }

    /// Attach a Receiver to an accepted connection.
    pub fn accept(&self, connection: Connection) {
        let peer = match connection.remote_peer() {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(protocol = %self.inner.name, error = %e, "Dropping inbound connection");
                self.inner.emit(ProtocolEvent::Error(e));
                return;
            }
        };

        let link = self.inner.next_link();
        tracing::info!(peer = %peer.id, protocol = %self.inner.name, %link, "Inbound link opened");
        self.inner.emit(ProtocolEvent::InboundOpened {
            peer: peer.clone(),
            link,
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = run_receiver(Arc::clone(&inner.store), peer.clone(), connection).await;
            inner.finish(Role::Receiver, peer, link, result.err());
        });
    }

    /// Attach a Sender to a connection dialed to `peer`.
    pub fn dialer_for(&self, peer: PeerInfo, connection: Connection) -> LinkId {
        let link = self.inner.next_link();
        tracing::info!(peer = %peer.id, protocol = %self.inner.name, %link, "Outbound link opened");
        self.inner.emit(ProtocolEvent::OutboundOpened {
            peer: peer.clone(),
            link,
        });

        let (clock_tx, clock_rx) = watch::channel(VectorClock::new());
        match self.inner.remote_clocks.write() {
            Ok(mut clocks) => {
                clocks.retain(|_, rx| rx.has_changed().is_ok());
                clocks.insert(peer.id, clock_rx);
            }
            Err(_) => tracing::warn!(peer = %peer.id, "Remote clock registry poisoned"),
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result =
                run_sender(Arc::clone(&inner.store), peer.clone(), connection, clock_tx).await;
            inner.finish(Role::Sender, peer, link, result.err());
        });
        link
    }

    /// Last clock the Sender link to `peer` learned from it.
    ///
    /// `None` if there is no live Sender link to `peer`.
    pub fn vector_clock(&self, peer: &PeerId) -> Option<VectorClock> {
        let clocks = self.inner.remote_clocks.read().ok()?;
        let rx = clocks.get(peer)?;
        rx.has_changed().ok()?;
        let clock = rx.borrow().clone();
        Some(clock)
    }
}

impl ProtocolInner {
    fn emit(&self, event: ProtocolEvent) {
        // The owner may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    fn next_link(&self) -> LinkId {
        LinkId(self.next_link.fetch_add(1, Ordering::Relaxed))
    }

    fn finish(&self, role: Role, peer: PeerInfo, link: LinkId, cause: Option<LinkError>) {
        match &cause {
            Some(e) => {
                tracing::warn!(peer = %peer.id, protocol = %self.name, %link, ?role, error = %e, "Link failed")
            }
            None => tracing::info!(peer = %peer.id, protocol = %self.name, %link, ?role, "Link closed"),
        }
        self.emit(ProtocolEvent::closed(role, peer, link, cause));
    }
}
