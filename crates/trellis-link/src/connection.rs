//! Duplex frame channel between two peers.
//!
//! A [`Connection`] splits into a [`FrameSink`] and a [`FrameStream`]. Both
//! ends of a connection share one cancellation token: ending either side
//! closes the whole connection, and the opposite stream finishes once it has
//! drained the frames already in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trellis_core::PeerInfo;

use crate::error::{LinkError, Result};

/// A frame, or the reason the remote end aborted.
type Frame = std::result::Result<Bytes, String>;

/// One end of an established connection.
pub struct Connection {
    remote: Option<PeerInfo>,
    sink: FrameSink,
    stream: FrameStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create both ends of a connection between `a` and `b`.
    ///
    /// The first connection is held by `a` and reports `b` as its remote, and
    /// the second the other way round. The returned closer ends the pair.
    pub fn pair(a: PeerInfo, b: PeerInfo) -> (Connection, Connection, ConnectionCloser) {
        let closed = CancellationToken::new();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let held_by_a = Connection {
            remote: Some(b),
            sink: FrameSink::new(a_tx, closed.clone()),
            stream: FrameStream {
                rx: a_rx,
                closed: closed.clone(),
            },
        };
        let held_by_b = Connection {
            remote: Some(a),
            sink: FrameSink::new(b_tx, closed.clone()),
            stream: FrameStream {
                rx: b_rx,
                closed: closed.clone(),
            },
        };

        (held_by_a, held_by_b, ConnectionCloser { closed })
    }

    /// Drop the remote identity, as when the transport cannot resolve it.
    pub fn with_unresolved_remote(mut self) -> Self {
        self.remote = None;
        self
    }

    /// Identity of the remote peer.
    pub fn remote_peer(&self) -> Result<PeerInfo> {
        self.remote.clone().ok_or_else(|| {
            LinkError::PeerInfoUnavailable("transport did not identify the remote peer".into())
        })
    }

    /// A handle that can close this connection from outside.
    pub fn closer(&self) -> ConnectionCloser {
        ConnectionCloser {
            closed: self.sink.closed.clone(),
        }
    }

    /// Split into the writing and reading halves.
    pub fn split(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

/// Closes a connection without owning either half.
#[derive(Clone)]
pub struct ConnectionCloser {
    closed: CancellationToken,
}

impl ConnectionCloser {
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Writing half of a connection.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
    ended: Arc<AtomicBool>,
}

impl FrameSink {
    fn new(tx: mpsc::UnboundedSender<Frame>, closed: CancellationToken) -> Self {
        Self {
            tx,
            closed,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a frame for the remote end.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.tx.send(Ok(frame)).map_err(|_| LinkError::Closed)
    }

    /// End the connection, passing `cause` on to the remote if given.
    ///
    /// Only the first call has any effect. Returns whether this call ended it.
    pub fn end(&self, cause: Option<&LinkError>) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(cause) = cause {
            if !self.closed.is_cancelled() {
                let _ = self.tx.send(Err(cause.to_string()));
            }
        }
        self.closed.cancel();
        true
    }

    /// True once this side ended or the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.ended.load(Ordering::SeqCst) || self.closed.is_cancelled()
    }
}

/// Reading half of a connection.
pub struct FrameStream {
    rx: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
}

impl FrameStream {
    /// Next frame from the remote end.
    ///
    /// Returns `None` once the connection is closed and drained, and an error
    /// if the remote aborted with a cause.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        let frame = tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.cancelled() => None,
        };

        frame.map(|frame| {
            frame.map_err(|cause| LinkError::Transport(format!("remote aborted: {cause}")))
        })
    }
}
