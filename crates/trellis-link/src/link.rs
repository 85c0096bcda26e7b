//! Sender and Receiver roles of a link.
//!
//! ## Message Flow
//!
//! ```text
//! Sender (dialer)                    Receiver (acceptor)
//!     |                                     |
//!     |<--------- Announce(latest) ---------|
//!     |                                     |
//!  [local change passes guard]              |
//!     |--------- Push(clock, state) ------->|
//!     |                                     | contains(clock)? -> Prune
//!     |<--------------- Prune --------------|  else save_state
//!     |                                     |
//!  [paused: announce only]                  |
//!     |--------- Announce(clock) ---------->|
//! ```
//!
//! Each role runs as one task per connection and ends the connection exactly
//! once, with the error that stopped it if any.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use trellis_core::{PeerInfo, VectorClock};
use trellis_store::{StateChange, Store};

use crate::connection::{Connection, FrameSink, FrameStream};
use crate::error::{LinkError, Result};
use crate::messages::LinkMessage;

/// Which side of a link this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opened the connection; pushes local state.
    Sender,
    /// Accepted the connection; persists what arrives.
    Receiver,
}

/// Flow state of the Sender role.
///
/// Pure bookkeeping: decides what, if anything, to send for each local
/// change and folds in what the remote reports.
#[derive(Debug, Clone)]
pub struct SenderState {
    vc: VectorClock,
    pushed_vc: VectorClock,
    pushing: bool,
}

impl SenderState {
    pub fn new() -> Self {
        Self {
            vc: VectorClock::new(),
            pushed_vc: VectorClock::new(),
            pushing: true,
        }
    }

    /// What the remote is known to have.
    pub fn remote_clock(&self) -> &VectorClock {
        &self.vc
    }

    /// Merge of every clock already sent.
    pub fn pushed_clock(&self) -> &VectorClock {
        &self.pushed_vc
    }

    /// False while the remote has asked us to stop sending payloads.
    pub fn is_pushing(&self) -> bool {
        self.pushing
    }

    /// Message to send for a local change, if it is news to the remote.
    ///
    /// The change must strictly dominate what the remote has and must not be
    /// covered by what was already sent.
    pub fn on_state_changed(&mut self, change: &StateChange) -> Option<LinkMessage> {
        let clock = &change.clock;
        if !clock.dominates_or_equals(&self.vc) || *clock == self.vc {
            return None;
        }
        if self.pushed_vc.dominates_or_equals(clock) {
            return None;
        }

        self.pushed_vc.merge_in(clock);
        if self.pushing {
            Some(LinkMessage::Push {
                clock: clock.clone(),
                state: change.state.clone(),
            })
        } else {
            Some(LinkMessage::Announce {
                clock: clock.clone(),
            })
        }
    }

    /// Apply a message from the remote. Returns true if `vc` advanced.
    pub fn on_message(&mut self, message: LinkMessage) -> bool {
        match message {
            LinkMessage::Announce { clock } => self.vc.merge_in(&clock),
            // The remote holds that state; the payload itself is of no use here.
            LinkMessage::Push { clock, .. } => self.vc.merge_in(&clock),
            LinkMessage::Prune => {
                self.pushing = false;
                false
            }
            LinkMessage::Resume => {
                self.pushing = true;
                false
            }
        }
    }
}

impl Default for SenderState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the Sender role until the connection ends.
///
/// Every advance of the remote clock is published on `remote_clock`.
pub async fn run_sender(
    store: Arc<dyn Store>,
    peer: PeerInfo,
    connection: Connection,
    remote_clock: watch::Sender<VectorClock>,
) -> Result<()> {
    let (sink, mut stream) = connection.split();
    let mut changes = store.subscribe();
    let result = sender_loop(&peer, &sink, &mut stream, &mut changes, &remote_clock).await;
    drop(changes);
    sink.end(result.as_ref().err());
    result
}

async fn sender_loop(
    peer: &PeerInfo,
    sink: &FrameSink,
    stream: &mut FrameStream,
    changes: &mut broadcast::Receiver<StateChange>,
    remote_clock: &watch::Sender<VectorClock>,
) -> Result<()> {
    let mut state = SenderState::new();

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => {
                    if let Some(message) = state.on_state_changed(&change) {
                        tracing::trace!(peer = %peer.id, clock = %change.clock, pushing = state.is_pushing(), "Sending update");
                        match send(sink, &message) {
                            Err(LinkError::Closed) => return Ok(()),
                            other => other?,
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(peer = %peer.id, skipped, "Sender lagged behind store changes");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            frame = stream.next() => match frame {
                None => return Ok(()),
                Some(frame) => {
                    let message = LinkMessage::decode(&frame?)?;
                    tracing::trace!(peer = %peer.id, ?message, "Sender received");
                    if state.on_message(message) {
                        remote_clock.send_replace(state.remote_clock().clone());
                    }
                }
            },
        }
    }
}

/// Run the Receiver role until the connection ends.
pub async fn run_receiver(store: Arc<dyn Store>, peer: PeerInfo, connection: Connection) -> Result<()> {
    let (sink, mut stream) = connection.split();
    let mut changes = store.subscribe();

    let (queue, queued) = mpsc::unbounded_channel();
    let (fault_tx, mut faults) = mpsc::unbounded_channel();
    let worker = tokio::spawn(save_worker(
        Arc::clone(&store),
        peer.clone(),
        sink.clone(),
        queued,
        fault_tx,
    ));

    let mut result =
        receiver_loop(&store, &peer, &sink, &mut stream, &mut changes, &queue, &mut faults).await;

    drop(changes);
    drop(queue);
    if result.is_ok() {
        // Pushes that arrived before a clean close are still persisted.
        result = match worker.await {
            Ok(()) => match faults.try_recv() {
                Ok(fault) => Err(fault),
                Err(_) => Ok(()),
            },
            Err(e) => Err(LinkError::Task(format!("save worker: {e}"))),
        };
    } else {
        worker.abort();
    }
    sink.end(result.as_ref().err());
    result
}

async fn receiver_loop(
    store: &Arc<dyn Store>,
    peer: &PeerInfo,
    sink: &FrameSink,
    stream: &mut FrameStream,
    changes: &mut broadcast::Receiver<StateChange>,
    queue: &mpsc::UnboundedSender<(VectorClock, Bytes)>,
    faults: &mut mpsc::UnboundedReceiver<LinkError>,
) -> Result<()> {
    let latest = store.get_latest_clock().await?;
    if let Err(e) = send(sink, &LinkMessage::Announce { clock: latest }) {
        return closed_is_clean(e);
    }

    loop {
        tokio::select! {
            Some(fault) = faults.recv() => return Err(fault),
            change = changes.recv() => match change {
                Ok(change) => {
                    if let Err(e) = send(sink, &LinkMessage::Announce { clock: change.clock }) {
                        return closed_is_clean(e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(peer = %peer.id, skipped, "Receiver lagged behind store changes");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            frame = stream.next() => match frame {
                None => return Ok(()),
                Some(frame) => match LinkMessage::decode(&frame?)? {
                    LinkMessage::Push { clock, state } => {
                        tracing::trace!(peer = %peer.id, clock = %clock, "Queued push");
                        // A closed queue means the worker failed; its fault is pending.
                        let _ = queue.send((clock, state));
                    }
                    LinkMessage::Announce { clock } => {
                        tracing::trace!(peer = %peer.id, clock = %clock, "Ignoring announce on receiver");
                    }
                    message @ (LinkMessage::Prune | LinkMessage::Resume) => {
                        tracing::debug!(peer = %peer.id, ?message, "Ignoring flow control on receiver");
                    }
                },
            },
        }
    }
}

/// Persist queued pushes one at a time, in arrival order.
async fn save_worker(
    store: Arc<dyn Store>,
    peer: PeerInfo,
    sink: FrameSink,
    mut queued: mpsc::UnboundedReceiver<(VectorClock, Bytes)>,
    faults: mpsc::UnboundedSender<LinkError>,
) {
    while let Some((clock, state)) = queued.recv().await {
        if let Err(e) = persist(store.as_ref(), &sink, clock, state).await {
            tracing::warn!(peer = %peer.id, error = %e, "Failed to persist pushed state");
            let _ = faults.send(e);
            return;
        }
    }
}

async fn persist(store: &dyn Store, sink: &FrameSink, clock: VectorClock, state: Bytes) -> Result<()> {
    if store.contains(&clock).await? {
        tracing::debug!(clock = %clock, "Redundant push, pruning");
        return match send(sink, &LinkMessage::Prune) {
            // Nothing left to prune once the connection is gone.
            Err(LinkError::Closed) => Ok(()),
            other => other,
        };
    }
    store.save_state(clock, state).await?;
    Ok(())
}

fn send(sink: &FrameSink, message: &LinkMessage) -> Result<()> {
    sink.send(message.encode()?)
}

fn closed_is_clean(e: LinkError) -> Result<()> {
    match e {
        LinkError::Closed => Ok(()),
        e => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use trellis_core::Keypair;
    use trellis_store::{MemoryStore, SaveResult, StoreError};

    fn vc(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|(a, c)| (*a, *c)))
    }

    fn change(entries: &[(&str, u64)], state: &'static [u8]) -> StateChange {
        StateChange {
            clock: vc(entries),
            state: Bytes::from_static(state),
        }
    }

    fn peer() -> PeerInfo {
        PeerInfo::new(Keypair::generate().peer_id())
    }

    async fn recv(stream: &mut FrameStream) -> LinkMessage {
        let frame = stream.next().await.unwrap().unwrap();
        LinkMessage::decode(&frame).unwrap()
    }

    // ─────────────────────────────────────────────────────────────────
    // SenderState
    // ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_sender_pushes_new_state() {
        let mut state = SenderState::new();
        let message = state.on_state_changed(&change(&[("a", 1)], b"s1")).unwrap();

        assert_eq!(
            message,
            LinkMessage::Push {
                clock: vc(&[("a", 1)]),
                state: Bytes::from_static(b"s1")
            }
        );
        assert_eq!(state.pushed_clock(), &vc(&[("a", 1)]));
    }

    #[test]
    fn test_sender_never_repushes() {
        let mut state = SenderState::new();
        assert!(state.on_state_changed(&change(&[("a", 1)], b"s1")).is_some());
        assert!(state.on_state_changed(&change(&[("a", 1)], b"s1")).is_none());

        assert!(state.on_state_changed(&change(&[("a", 2)], b"s2")).is_some());
        // Older clock already covered by what was pushed.
        assert!(state.on_state_changed(&change(&[("a", 1)], b"s1")).is_none());
    }

    #[test]
    fn test_sender_skips_what_remote_has() {
        let mut state = SenderState::new();
        assert!(state.on_message(LinkMessage::Announce { clock: vc(&[("a", 2)]) }));

        assert!(state.on_state_changed(&change(&[("a", 2)], b"same")).is_none());
        assert!(state.on_state_changed(&change(&[("a", 1)], b"older")).is_none());
        // Concurrent with the remote: not pushed.
        assert!(state.on_state_changed(&change(&[("b", 1)], b"other")).is_none());
        assert!(state.on_state_changed(&change(&[("a", 2), ("b", 1)], b"newer")).is_some());
    }

    #[test]
    fn test_prune_pauses_payloads_but_not_announces() {
        let mut state = SenderState::new();
        assert!(!state.on_message(LinkMessage::Prune));
        assert!(!state.is_pushing());

        let message = state.on_state_changed(&change(&[("a", 1)], b"s1")).unwrap();
        assert_eq!(message, LinkMessage::Announce { clock: vc(&[("a", 1)]) });

        state.on_message(LinkMessage::Resume);
        assert!(state.is_pushing());
        let message = state.on_state_changed(&change(&[("a", 2)], b"s2")).unwrap();
        assert!(matches!(message, LinkMessage::Push { .. }));
    }

    #[test]
    fn test_push_on_sender_advances_remote_clock() {
        let mut state = SenderState::new();
        let advanced = state.on_message(LinkMessage::Push {
            clock: vc(&[("b", 3)]),
            state: Bytes::from_static(b"ignored"),
        });

        assert!(advanced);
        assert_eq!(state.remote_clock(), &vc(&[("b", 3)]));
        assert!(!state.on_message(LinkMessage::Announce { clock: vc(&[("b", 1)]) }));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        fn clock() -> impl Strategy<Value = VectorClock> {
            prop::collection::btree_map("[a-d]", 0u64..5, 0..4)
                .prop_map(|entries: BTreeMap<String, u64>| VectorClock::from(entries))
        }

        proptest! {
            #[test]
            fn prop_sender_only_sends_news(remote in clock(), changes in prop::collection::vec(clock(), 1..24)) {
                let mut state = SenderState::new();
                state.on_message(LinkMessage::Announce { clock: remote });

                for clock in changes {
                    let pushed = state.pushed_clock().clone();
                    let known = state.remote_clock().clone();
                    let change = StateChange { clock: clock.clone(), state: Bytes::new() };

                    if state.on_state_changed(&change).is_some() {
                        prop_assert!(!pushed.dominates_or_equals(&clock));
                        prop_assert!(!known.dominates_or_equals(&clock));
                        prop_assert!(state.pushed_clock().dominates_or_equals(&clock));
                    } else {
                        prop_assert_eq!(state.pushed_clock(), &pushed);
                    }
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Receiver
    // ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_receiver_announces_latest_on_attach() {
        let store = Arc::new(MemoryStore::new());
        store.record_local("r", "local").unwrap();

        let (ours, theirs, _closer) = Connection::pair(peer(), peer());
        let task = tokio::spawn(run_receiver(store.clone(), peer(), theirs));
        let (sink, mut stream) = ours.split();

        assert_eq!(recv(&mut stream).await, LinkMessage::Announce { clock: vc(&[("r", 1)]) });

        sink.end(None);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_receiver_saves_push_and_prunes_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let (ours, theirs, _closer) = Connection::pair(peer(), peer());
        let task = tokio::spawn(run_receiver(store.clone(), peer(), theirs));
        let (sink, mut stream) = ours.split();
        assert_eq!(recv(&mut stream).await, LinkMessage::Announce { clock: VectorClock::new() });

        let clock = vc(&[("s", 1)]);
        let first = LinkMessage::Push { clock: clock.clone(), state: Bytes::from_static(b"first") };
        let second = LinkMessage::Push { clock: clock.clone(), state: Bytes::from_static(b"second") };
        sink.send(first.encode().unwrap()).unwrap();
        sink.send(second.encode().unwrap()).unwrap();

        // The save is announced back and the duplicate pruned, in either order.
        let replies = [recv(&mut stream).await, recv(&mut stream).await];
        assert!(replies.contains(&LinkMessage::Announce { clock: clock.clone() }));
        assert!(replies.contains(&LinkMessage::Prune));
        assert_eq!(store.get_state(&clock).unwrap().unwrap(), Bytes::from_static(b"first"));

        sink.end(None);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_receiver_ignores_announce() {
        let store = Arc::new(MemoryStore::new());
        let (ours, theirs, _closer) = Connection::pair(peer(), peer());
        let task = tokio::spawn(run_receiver(store.clone(), peer(), theirs));
        let (sink, mut stream) = ours.split();
        recv(&mut stream).await;

        let announce = LinkMessage::Announce { clock: vc(&[("s", 9)]) };
        sink.send(announce.encode().unwrap()).unwrap();
        sink.send(LinkMessage::Resume.encode().unwrap()).unwrap();
        sink.end(None);

        assert!(task.await.unwrap().is_ok());
        assert!(store.is_empty().unwrap());
        assert!(store.get_latest_clock().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receiver_decode_failure_ends_link() {
        let store = Arc::new(MemoryStore::new());
        let (ours, theirs, _closer) = Connection::pair(peer(), peer());
        let task = tokio::spawn(run_receiver(store.clone(), peer(), theirs));
        let (sink, mut stream) = ours.split();
        recv(&mut stream).await;

        sink.send(Bytes::from_static(b"\xff\xffnot cbor")).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::Decode(_)));
        // The cause is passed on, then the stream ends.
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    /// Store that refuses every write.
    struct FailingStore {
        changes: broadcast::Sender<StateChange>,
    }

    impl FailingStore {
        fn new() -> Self {
            Self {
                changes: broadcast::channel(16).0,
            }
        }
    }

    #[async_trait::async_trait]
    impl Store for FailingStore {
        async fn get_latest_clock(&self) -> trellis_store::Result<VectorClock> {
            Ok(VectorClock::new())
        }

        async fn contains(&self, _clock: &VectorClock) -> trellis_store::Result<bool> {
            Ok(false)
        }

        async fn save_state(&self, _clock: VectorClock, _state: Bytes) -> trellis_store::Result<SaveResult> {
            Err(StoreError::Backend("disk full".into()))
        }

        fn subscribe(&self) -> broadcast::Receiver<StateChange> {
            self.changes.subscribe()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SaveStep {
        Started(VectorClock),
        Finished(VectorClock),
    }

    /// Memory store whose saves block until the test releases them.
    struct GatedStore {
        inner: MemoryStore,
        gate: Notify,
        steps: Mutex<Vec<SaveStep>>,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                gate: Notify::new(),
                steps: Mutex::new(Vec::new()),
            }
        }

        fn steps(&self) -> Vec<SaveStep> {
            self.steps.lock().unwrap().clone()
        }

        async fn wait_for_steps(&self, count: usize) {
            while self.steps().len() < count {
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait::async_trait]
    impl Store for GatedStore {
        async fn get_latest_clock(&self) -> trellis_store::Result<VectorClock> {
            self.inner.get_latest_clock().await
        }

        async fn contains(&self, clock: &VectorClock) -> trellis_store::Result<bool> {
            self.inner.contains(clock).await
        }

        async fn save_state(&self, clock: VectorClock, state: Bytes) -> trellis_store::Result<SaveResult> {
            self.steps.lock().unwrap().push(SaveStep::Started(clock.clone()));
            self.gate.notified().await;
            let result = self.inner.save_state(clock.clone(), state).await;
            self.steps.lock().unwrap().push(SaveStep::Finished(clock));
            result
        }

        fn subscribe(&self) -> broadcast::Receiver<StateChange> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn test_receiver_reports_failed_save_after_clean_close() {
        let (ours, theirs, _closer) = Connection::pair(peer(), peer());
        let task = tokio::spawn(run_receiver(Arc::new(FailingStore::new()), peer(), theirs));
        let (sink, mut stream) = ours.split();
        recv(&mut stream).await;

        let push = LinkMessage::Push { clock: vc(&[("s", 1)]), state: Bytes::from_static(b"lost") };
        sink.send(push.encode().unwrap()).unwrap();
        sink.end(None);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::Store(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_receiver_saves_pushes_one_at_a_time_in_order() {
        let store = Arc::new(GatedStore::new());
        let (ours, theirs, _closer) = Connection::pair(peer(), peer());
        let task = tokio::spawn(run_receiver(store.clone(), peer(), theirs));
        let (sink, mut stream) = ours.split();
        recv(&mut stream).await;

        let (c1, c2) = (vc(&[("s", 1)]), vc(&[("s", 2)]));
        for clock in [&c1, &c2] {
            let push = LinkMessage::Push { clock: clock.clone(), state: Bytes::from_static(b"s") };
            sink.send(push.encode().unwrap()).unwrap();
        }

        store.wait_for_steps(1).await;
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
        // The second save waits for the first to finish.
        assert_eq!(store.steps(), vec![SaveStep::Started(c1.clone())]);

        store.gate.notify_one();
        store.wait_for_steps(3).await;
        store.gate.notify_one();
        store.wait_for_steps(4).await;

        assert_eq!(
            store.steps(),
            vec![
                SaveStep::Started(c1.clone()),
                SaveStep::Finished(c1),
                SaveStep::Started(c2.clone()),
                SaveStep::Finished(c2),
            ]
        );

        sink.end(None);
        assert!(task.await.unwrap().is_ok());
    }

    // ─────────────────────────────────────────────────────────────────
    // Sender
    // ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_sender_pushes_local_changes_and_tracks_remote() {
        let store = Arc::new(MemoryStore::new());
        let (clock_tx, clock_rx) = watch::channel(VectorClock::new());
        let (ours, theirs, _closer) = Connection::pair(peer(), peer());
        let task = tokio::spawn(run_sender(store.clone(), peer(), theirs, clock_tx));
        let (sink, mut stream) = ours.split();

        sink.send(LinkMessage::Announce { clock: vc(&[("r", 4)]) }.encode().unwrap())
            .unwrap();
        let mut clock_rx2 = clock_rx.clone();
        clock_rx2.changed().await.unwrap();
        assert_eq!(*clock_rx.borrow(), vc(&[("r", 4)]));

        store
            .save_state(vc(&[("r", 4), ("s", 1)]), Bytes::from_static(b"merged"))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut stream).await,
            LinkMessage::Push {
                clock: vc(&[("r", 4), ("s", 1)]),
                state: Bytes::from_static(b"merged")
            }
        );

        sink.end(None);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sender_decode_failure_ends_link() {
        let store = Arc::new(MemoryStore::new());
        let (clock_tx, _clock_rx) = watch::channel(VectorClock::new());
        let (ours, theirs, _closer) = Connection::pair(peer(), peer());
        let task = tokio::spawn(run_sender(store, peer(), theirs, clock_tx));
        let (sink, _stream) = ours.split();

        sink.send(Bytes::from_static(b"\x00")).unwrap();

        assert!(task.await.unwrap().is_err());
    }
}
