//! A transport wrapper that records every dial and hang-up.

use std::sync::Mutex;

use async_trait::async_trait;
use trellis_core::{PeerId, PeerInfo};
use trellis_link::{Connection, ConnectionHandler, Result, Transport};

/// Delegates to an inner transport and keeps a log of calls.
pub struct RecordingTransport<T> {
    inner: T,
    log: Mutex<CallLog>,
}

#[derive(Default)]
struct CallLog {
    connects: Vec<PeerId>,
    disconnects: Vec<PeerId>,
}

impl<T: Transport> RecordingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            log: Mutex::new(CallLog::default()),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Total `connect` calls, successful or not.
    pub fn connect_count(&self) -> usize {
        self.with_log(|log| log.connects.len())
    }

    /// Total `disconnect` calls.
    pub fn disconnect_count(&self) -> usize {
        self.with_log(|log| log.disconnects.len())
    }

    /// `connect` calls addressed to `peer`.
    pub fn connects_to(&self, peer: &PeerId) -> usize {
        self.with_log(|log| log.connects.iter().filter(|p| *p == peer).count())
    }

    /// `disconnect` calls addressed to `peer`.
    pub fn disconnects_from(&self, peer: &PeerId) -> usize {
        self.with_log(|log| log.disconnects.iter().filter(|p| *p == peer).count())
    }

    fn with_log<R>(&self, f: impl FnOnce(&mut CallLog) -> R) -> R {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut log)
    }
}

#[async_trait]
impl<T: Transport> Transport for RecordingTransport<T> {
    async fn handle(&self, protocol: &str, handler: ConnectionHandler) -> Result<()> {
        self.inner.handle(protocol, handler).await
    }

    async fn unhandle(&self, protocol: &str) -> Result<()> {
        self.inner.unhandle(protocol).await
    }

    async fn connect(&self, peer: &PeerInfo, protocol: &str) -> Result<Connection> {
        self.with_log(|log| log.connects.push(peer.id));
        self.inner.connect(peer, protocol).await
    }

    async fn disconnect(&self, peer: &PeerInfo, protocol: &str) -> Result<()> {
        self.with_log(|log| log.disconnects.push(peer.id));
        self.inner.disconnect(peer, protocol).await
    }

    fn local_peer(&self) -> PeerInfo {
        self.inner.local_peer()
    }
}
