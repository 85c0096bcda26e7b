//! Transport abstraction for links.
//!
//! A transport opens protocol-scoped connections to peers and routes
//! incoming connections to registered handlers. Implementations may sit on
//! QUIC, TCP, WebRTC or anything else that yields framed duplex streams.

use std::sync::Arc;

use async_trait::async_trait;
use trellis_core::PeerInfo;

use crate::connection::Connection;
use crate::error::Result;

/// Callback invoked with every incoming connection for a protocol.
pub type ConnectionHandler = Arc<dyn Fn(Connection) + Send + Sync>;

/// Transport trait for opening and accepting connections.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Route incoming connections for `protocol` to `handler`.
    ///
    /// Replaces any handler already registered for the protocol.
    async fn handle(&self, protocol: &str, handler: ConnectionHandler) -> Result<()>;

    /// Stop accepting connections for `protocol`.
    async fn unhandle(&self, protocol: &str) -> Result<()>;

    /// Open a connection to `peer` speaking `protocol`.
    async fn connect(&self, peer: &PeerInfo, protocol: &str) -> Result<Connection>;

    /// Close the connection to `peer` opened for `protocol`.
    async fn disconnect(&self, peer: &PeerInfo, protocol: &str) -> Result<()>;

    /// The local node's identity.
    fn local_peer(&self) -> PeerInfo;
}

/// A simple in-memory transport for testing.
///
/// Every transport created from one [`memory::MemoryNetwork`] can dial the
/// others. Peers can be made unreachable to exercise dial failures.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::RwLock;
    use trellis_core::PeerId;

    use crate::connection::ConnectionCloser;
    use crate::error::LinkError;

    /// Dialer, listener, protocol.
    type LinkKey = (PeerId, PeerId, String);

    /// Shared state for the memory transport network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        inner: RwLock<NetworkInner>,
    }

    #[derive(Default)]
    struct NetworkInner {
        /// Registered handlers per peer and protocol.
        handlers: HashMap<PeerId, HashMap<String, ConnectionHandler>>,
        /// Peers that refuse every dial.
        unreachable: HashSet<PeerId>,
        /// Peers whose outbound connections arrive without identity.
        anonymous: HashSet<PeerId>,
        /// Open connections.
        links: HashMap<LinkKey, ConnectionCloser>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport connected to this network.
        pub fn create_transport(self: &Arc<Self>, local: PeerInfo) -> MemoryTransport {
            MemoryTransport {
                local,
                network: Arc::clone(self),
            }
        }

        /// Make `peer` refuse (or accept again) incoming dials.
        pub async fn set_reachable(&self, peer: &PeerId, reachable: bool) {
            let mut inner = self.inner.write().await;
            if reachable {
                inner.unreachable.remove(peer);
            } else {
                inner.unreachable.insert(*peer);
            }
        }

        /// Deliver connections dialed by `peer` without the dialer's identity.
        pub async fn set_anonymous(&self, peer: &PeerId, anonymous: bool) {
            let mut inner = self.inner.write().await;
            if anonymous {
                inner.anonymous.insert(*peer);
            } else {
                inner.anonymous.remove(peer);
            }
        }

        /// Close every connection between `a` and `b`, in either direction.
        ///
        /// Returns how many connections were closed.
        pub async fn sever(&self, a: &PeerId, b: &PeerId) -> usize {
            let mut inner = self.inner.write().await;
            let keys: Vec<LinkKey> = inner
                .links
                .keys()
                .filter(|(from, to, _)| (from == a && to == b) || (from == b && to == a))
                .cloned()
                .collect();

            for key in &keys {
                if let Some(closer) = inner.links.remove(key) {
                    closer.close();
                }
            }
            keys.len()
        }

        /// Number of connections currently open.
        pub async fn open_connections(&self) -> usize {
            let mut inner = self.inner.write().await;
            inner.links.retain(|_, closer| !closer.is_closed());
            inner.links.len()
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        local: PeerInfo,
        network: Arc<MemoryNetwork>,
    }

    impl MemoryTransport {
        /// The network this transport belongs to.
        pub fn network(&self) -> &Arc<MemoryNetwork> {
            &self.network
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn handle(&self, protocol: &str, handler: ConnectionHandler) -> Result<()> {
            let mut inner = self.network.inner.write().await;
            inner
                .handlers
                .entry(self.local.id)
                .or_default()
                .insert(protocol.to_string(), handler);
            Ok(())
        }

        async fn unhandle(&self, protocol: &str) -> Result<()> {
            let mut inner = self.network.inner.write().await;
            if let Some(handlers) = inner.handlers.get_mut(&self.local.id) {
                handlers.remove(protocol);
            }
            Ok(())
        }

        async fn connect(&self, peer: &PeerInfo, protocol: &str) -> Result<Connection> {
            let (ours, theirs, handler) = {
                let mut inner = self.network.inner.write().await;
                if inner.unreachable.contains(&peer.id) {
                    return Err(LinkError::Transport(format!("peer {} unreachable", peer.id)));
                }
                let handler = inner
                    .handlers
                    .get(&peer.id)
                    .and_then(|handlers| handlers.get(protocol))
                    .cloned()
                    .ok_or_else(|| {
                        LinkError::Transport(format!("peer {} does not speak {}", peer.id, protocol))
                    })?;

                let (ours, theirs, closer) = Connection::pair(self.local.clone(), peer.clone());
                let theirs = if inner.anonymous.contains(&self.local.id) {
                    theirs.with_unresolved_remote()
                } else {
                    theirs
                };

                let key = (self.local.id, peer.id, protocol.to_string());
                if let Some(previous) = inner.links.insert(key, closer) {
                    previous.close();
                }
                (ours, theirs, handler)
            };

            handler(theirs);
            Ok(ours)
        }

        async fn disconnect(&self, peer: &PeerInfo, protocol: &str) -> Result<()> {
            let key = (self.local.id, peer.id, protocol.to_string());
            let closer = self.network.inner.write().await.links.remove(&key);
            match closer {
                Some(closer) => {
                    closer.close();
                    Ok(())
                }
                None => Err(LinkError::Transport(format!(
                    "no {} connection to {}",
                    protocol, peer.id
                ))),
            }
        }

        fn local_peer(&self) -> PeerInfo {
            self.local.clone()
        }
    }

}
