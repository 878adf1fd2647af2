use mesh_protocol::{ParticipantId, SignalingEnvelope};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::MeshError;
use crate::media::LocalMedia;
use crate::notify::PeerNotifier;
use crate::signaling::{ChannelEvent, SignalingError, SignalingSender};
use crate::transport::{OfferOptions, TransportEvent, TransportEventKind, TransportFactory};

pub mod join;
pub mod peer;

use join::JoinOrchestrator;
use peer::{
    FailureCause, PeerCommand, PeerTaskContext, SessionFailure, TransportSlot, publish,
    run_peer_task,
};
pub use peer::{PeerRole, PeerSession, PeerState, SessionError};

struct PeerHandle {
    role: PeerRole,
    generation: u64,
    commands: mpsc::UnboundedSender<PeerCommand>,
    state: Arc<watch::Sender<PeerState>>,
    transport: TransportSlot,
    task: JoinHandle<()>,
    announced: bool,
}

#[derive(Clone)]
struct DirectoryEntry {
    role: PeerRole,
    state: watch::Receiver<PeerState>,
}

/// Read-only view of the live sessions, shareable outside the dispatch loop.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<RwLock<HashMap<ParticipantId, DirectoryEntry>>>,
}

impl PeerDirectory {
    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.inner.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.inner.read().contains_key(peer)
    }

    pub fn state(&self, peer: &ParticipantId) -> Option<PeerState> {
        self.inner.read().get(peer).map(|entry| *entry.state.borrow())
    }

    pub fn role(&self, peer: &ParticipantId) -> Option<PeerRole> {
        self.inner.read().get(peer).map(|entry| entry.role)
    }

    pub fn watch(&self, peer: &ParticipantId) -> Option<watch::Receiver<PeerState>> {
        self.inner.read().get(peer).map(|entry| entry.state.clone())
    }

    fn insert(&self, peer: ParticipantId, entry: DirectoryEntry) {
        self.inner.write().insert(peer, entry);
    }

    fn remove(&self, peer: &ParticipantId) {
        self.inner.write().remove(peer);
    }
}

/// Owns every peer session of the local participant and routes signaling
/// envelopes and transport events to them.
pub struct SessionManager {
    local_id: ParticipantId,
    media: LocalMedia,
    offer: OfferOptions,
    orchestrator: JoinOrchestrator,
    factory: Arc<dyn TransportFactory>,
    signaling: SignalingSender,
    notifier: Arc<dyn PeerNotifier>,
    peers: HashMap<ParticipantId, PeerHandle>,
    directory: PeerDirectory,
    next_generation: u64,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    failure_tx: mpsc::UnboundedSender<SessionFailure>,
    failure_rx: mpsc::UnboundedReceiver<SessionFailure>,
    closed: bool,
}

impl SessionManager {
    pub fn new(
        local_id: ParticipantId,
        media: LocalMedia,
        signaling: SignalingSender,
        factory: Arc<dyn TransportFactory>,
        notifier: Arc<dyn PeerNotifier>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        Self {
            local_id,
            media,
            offer: OfferOptions::default(),
            orchestrator: JoinOrchestrator::default(),
            factory,
            signaling,
            notifier,
            peers: HashMap::new(),
            directory: PeerDirectory::default(),
            next_generation: 0,
            transport_tx,
            transport_rx,
            failure_tx,
            failure_rx,
            closed: false,
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.orchestrator = JoinOrchestrator::new(max_peers);
        self
    }

    pub fn with_offer_options(mut self, offer: OfferOptions) -> Self {
        self.offer = offer;
        self
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn directory(&self) -> PeerDirectory {
        self.directory.clone()
    }

    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        self.directory.ids()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_state(&self, peer: &ParticipantId) -> Option<PeerState> {
        self.directory.state(peer)
    }

    pub fn peer_role(&self, peer: &ParticipantId) -> Option<PeerRole> {
        self.peers.get(peer).map(|handle| handle.role)
    }

    pub fn watch_peer(&self, peer: &ParticipantId) -> Option<watch::Receiver<PeerState>> {
        self.directory.watch(peer)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Dispatch loop. Ends once the signaling channel closes.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<ChannelEvent>) {
        tracing::debug!(target = "mesh", local = %self.local_id, "session manager started");
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(ChannelEvent::Envelope(envelope)) => {
                        if let Err(err) = self.handle_envelope(envelope) {
                            tracing::warn!(target = "mesh", error = %err, "envelope rejected");
                        }
                    }
                    Some(ChannelEvent::Closed { reason }) => {
                        self.shutdown(&reason);
                        break;
                    }
                    None => {
                        self.shutdown("signaling channel dropped");
                        break;
                    }
                },
                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event),
                Some(failure) = self.failure_rx.recv() => self.handle_session_failure(failure),
            }
        }
        tracing::debug!(target = "mesh", local = %self.local_id, "session manager stopped");
    }

    pub fn handle_envelope(&mut self, envelope: SignalingEnvelope) -> Result<(), MeshError> {
        if self.closed {
            tracing::debug!(target = "mesh", kind = %envelope.kind(), "manager closed; dropping envelope");
            return Ok(());
        }
        tracing::trace!(target = "mesh", kind = %envelope.kind(), peer = ?envelope.peer(), "envelope in");

        match envelope {
            SignalingEnvelope::JoinAnnounce { roster } => self.handle_roster(&roster),
            SignalingEnvelope::PeerJoined { peer } => {
                if peer == self.local_id || self.peers.contains_key(&peer) {
                    tracing::debug!(target = "mesh", peer = %peer, "ignoring join for known participant");
                } else {
                    self.spawn_session(peer, PeerRole::Responder);
                }
                Ok(())
            }
            SignalingEnvelope::PeerLeft { peer } => {
                self.remove_peer(&peer, "peer left");
                Ok(())
            }
            SignalingEnvelope::Offer { peer, offer } => {
                if peer == self.local_id {
                    tracing::warn!(target = "mesh", "dropping offer addressed from ourselves");
                    return Ok(());
                }
                if !self.peers.contains_key(&peer) {
                    self.spawn_session(peer.clone(), PeerRole::Responder);
                }
                self.dispatch(&peer, PeerCommand::Offer(offer));
                Ok(())
            }
            SignalingEnvelope::Answer { peer, answer } => {
                self.dispatch(&peer, PeerCommand::Answer(answer));
                Ok(())
            }
            SignalingEnvelope::Candidate { peer, candidate } => {
                self.dispatch(&peer, PeerCommand::RemoteCandidate(candidate));
                Ok(())
            }
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(handle) = self
            .peers
            .get_mut(&event.peer)
            .filter(|handle| handle.generation == event.generation)
        else {
            tracing::trace!(
                target = "mesh",
                peer = %event.peer,
                generation = event.generation,
                "dropping stale transport event"
            );
            return;
        };

        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let _ = handle.commands.send(PeerCommand::LocalCandidate(candidate));
            }
            TransportEventKind::Connectivity(state) => {
                tracing::debug!(target = "mesh", peer = %event.peer, state = ?state, "connectivity");
                let _ = handle.commands.send(PeerCommand::Connectivity(state));
            }
            TransportEventKind::RemoteMedia(media) => {
                if !handle.announced {
                    handle.announced = true;
                    self.notifier.peer_joined(&event.peer, media);
                }
            }
        }
    }

    pub(crate) fn handle_session_failure(&mut self, failure: SessionFailure) {
        let live = self
            .peers
            .get(&failure.peer)
            .is_some_and(|handle| handle.generation == failure.generation);
        if !live {
            return;
        }
        match failure.cause {
            FailureCause::Negotiation(error) => {
                let error = MeshError::from(error);
                tracing::warn!(target = "mesh", peer = %failure.peer, error = %error, "peer session failed");
                self.notifier.error(&error);
                self.remove_peer(&failure.peer, "negotiation failed");
            }
            FailureCause::ConnectionLost(state) => {
                tracing::info!(target = "mesh", peer = %failure.peer, state = ?state, "peer connection lost");
                self.remove_peer(&failure.peer, "connection lost");
            }
        }
    }

    /// Tear down one session. Returns false if there was none.
    pub fn remove_peer(&mut self, peer: &ParticipantId, reason: &str) -> bool {
        let Some(handle) = self.peers.remove(peer) else {
            return false;
        };
        self.directory.remove(peer);
        publish(&handle.state, PeerState::Disconnected);
        // An empty slot means the task is still opening its transport or is
        // closing it already. Either way it finishes on its own.
        let transport = handle.transport.lock().take();
        if let Some(transport) = transport {
            handle.task.abort();
            tokio::spawn(async move {
                transport.close().await;
            });
        }
        tracing::info!(
            target = "mesh",
            peer = %peer,
            generation = handle.generation,
            reason,
            "peer session removed"
        );
        self.notifier.peer_left(peer);
        true
    }

    /// Global teardown after the signaling channel is gone.
    pub fn shutdown(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let peers: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.remove_peer(&peer, "signaling closed");
        }
        tracing::warn!(target = "mesh", reason, "signaling channel closed; mesh torn down");
        self.notifier
            .error(&MeshError::Signaling(SignalingError::ChannelClosed));
    }

    fn handle_roster(&mut self, roster: &[ParticipantId]) -> Result<(), MeshError> {
        let plan = match self
            .orchestrator
            .plan(roster, &self.local_id, |id| self.peers.contains_key(id))
        {
            Ok(plan) => plan,
            Err(err) => {
                let err = MeshError::from(err);
                tracing::warn!(target = "mesh", error = %err, "join rejected");
                self.notifier.error(&err);
                return Err(err);
            }
        };
        for peer in &plan.skipped {
            tracing::debug!(target = "mesh", peer = %peer, "roster member already has a session");
        }
        tracing::info!(target = "mesh", peers = plan.initiate.len(), "joining mesh");
        for peer in plan.initiate {
            self.spawn_session(peer.clone(), PeerRole::Initiator);
            self.dispatch(&peer, PeerCommand::StartOffer(self.offer));
        }
        Ok(())
    }

    fn spawn_session(&mut self, peer: ParticipantId, role: PeerRole) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(PeerState::New);
        let state = Arc::new(state);
        let transport: TransportSlot = Arc::new(Mutex::new(None));

        let ctx = PeerTaskContext {
            peer: peer.clone(),
            generation,
            role,
            factory: Arc::clone(&self.factory),
            media: self.media.clone(),
            signaling: self.signaling.clone(),
            state: Arc::clone(&state),
            transport: Arc::clone(&transport),
            transport_events: self.transport_tx.clone(),
            failures: self.failure_tx.clone(),
        };
        let task = tokio::spawn(run_peer_task(ctx, commands_rx));

        self.directory.insert(
            peer.clone(),
            DirectoryEntry {
                role,
                state: state_rx,
            },
        );
        tracing::debug!(target = "mesh", peer = %peer, generation, role = %role, "peer session created");
        self.peers.insert(
            peer,
            PeerHandle {
                role,
                generation,
                commands,
                state,
                transport,
                task,
                announced: false,
            },
        );
        generation
    }

    fn dispatch(&self, peer: &ParticipantId, command: PeerCommand) {
        match self.peers.get(peer) {
            Some(handle) => {
                if handle.commands.send(command).is_err() {
                    tracing::debug!(target = "mesh", peer = %peer, "peer task already finished");
                }
            }
            None => {
                tracing::debug!(
                    target = "mesh",
                    peer = %peer,
                    command = ?command,
                    "dropping signal for unknown peer"
                );
            }
        }
    }

    /// Handle queued transport events and failures without the run loop.
    #[cfg(test)]
    fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.transport_rx.try_recv() {
                self.handle_transport_event(event);
            } else if let Ok(failure) = self.failure_rx.try_recv() {
                self.handle_session_failure(failure);
            } else {
                return handled;
            }
            handled += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::notify::{ChannelNotifier, Notification};
    use crate::signaling::Outbox;
    use crate::transport::ConnectivityState;
    use crate::transport::mock::{MockCall, MockTransportFactory};
    use mesh_protocol::{IceCandidate, SessionDescription};
    use std::time::Duration;

    struct Harness {
        manager: SessionManager,
        factory: MockTransportFactory,
        outbox: Outbox,
        notifications: mpsc::UnboundedReceiver<Notification>,
    }

    fn harness() -> Harness {
        let factory = MockTransportFactory::new();
        let (signaling, outbox) = SignalingSender::detached();
        let (notifier, notifications) = ChannelNotifier::new();
        let manager = SessionManager::new(
            "me".into(),
            LocalMedia::default(),
            signaling,
            Arc::new(factory.clone()),
            Arc::new(notifier),
        );
        Harness {
            manager,
            factory,
            outbox,
            notifications,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn lefts(notifications: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<String> {
        let mut left = Vec::new();
        while let Ok(notification) = notifications.try_recv() {
            if let Notification::Left { peer } = notification {
                left.push(peer.to_string());
            }
        }
        left
    }

    #[tokio::test]
    async fn roster_creates_initiators_that_offer_once() {
        let mut h = harness();
        h.manager
            .handle_envelope(SignalingEnvelope::JoinAnnounce {
                roster: vec!["a".into(), "me".into(), "b".into(), "a".into()],
            })
            .unwrap();
        assert_eq!(h.manager.peer_count(), 2);
        assert_eq!(h.manager.peer_role(&"a".into()), Some(PeerRole::Initiator));

        let mut offered = Vec::new();
        for _ in 0..2 {
            let envelope = tokio::time::timeout(Duration::from_secs(1), h.outbox.recv())
                .await
                .expect("offer")
                .expect("open");
            match envelope {
                SignalingEnvelope::Offer { peer, .. } => offered.push(peer.to_string()),
                other => panic!("unexpected {other:?}"),
            }
        }
        offered.sort();
        assert_eq!(offered, vec!["a", "b"]);
        settle().await;
        assert!(h.outbox.drain().is_empty());
        assert_eq!(
            h.manager.peer_state(&"a".into()),
            Some(PeerState::AnswerPending)
        );
    }

    #[tokio::test]
    async fn oversized_roster_is_reported_and_creates_nothing() {
        let mut h = harness();
        let roster = (0..11).map(|n| ParticipantId::new(format!("p{n}"))).collect();
        let err = h
            .manager
            .handle_envelope(SignalingEnvelope::JoinAnnounce { roster })
            .unwrap_err();
        assert!(matches!(err, MeshError::Join(_)));
        assert_eq!(h.manager.peer_count(), 0);
        assert!(matches!(
            h.notifications.try_recv(),
            Ok(Notification::Error { .. })
        ));
        settle().await;
        assert_eq!(h.factory.opened_count(), 0);
    }

    #[tokio::test]
    async fn unknown_offer_creates_responder_but_answer_does_not() {
        let mut h = harness();
        h.manager
            .handle_envelope(SignalingEnvelope::Answer {
                peer: "x".into(),
                answer: SessionDescription::answer("v=0"),
            })
            .unwrap();
        h.manager
            .handle_envelope(SignalingEnvelope::Candidate {
                peer: "x".into(),
                candidate: IceCandidate::new("candidate:0"),
            })
            .unwrap();
        assert_eq!(h.manager.peer_count(), 0);

        h.manager
            .handle_envelope(SignalingEnvelope::Offer {
                peer: "x".into(),
                offer: SessionDescription::offer("v=0"),
            })
            .unwrap();
        assert_eq!(h.manager.peer_role(&"x".into()), Some(PeerRole::Responder));
        let answer = tokio::time::timeout(Duration::from_secs(1), h.outbox.recv())
            .await
            .expect("answer")
            .expect("open");
        assert!(matches!(answer, SignalingEnvelope::Answer { peer, .. } if peer.as_str() == "x"));
    }

    #[tokio::test]
    async fn peer_joined_ignores_self_and_duplicates() {
        let mut h = harness();
        for peer in ["me", "b", "b"] {
            h.manager
                .handle_envelope(SignalingEnvelope::PeerJoined { peer: peer.into() })
                .unwrap();
        }
        assert_eq!(h.manager.peer_ids(), vec![ParticipantId::new("b")]);
        assert_eq!(h.manager.peer_role(&"b".into()), Some(PeerRole::Responder));
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_reports_once() {
        let mut h = harness();
        h.manager
            .handle_envelope(SignalingEnvelope::PeerJoined { peer: "b".into() })
            .unwrap();
        let transport = h.factory.wait_for_transport(&"b".into()).await;
        let mut watch = h.manager.watch_peer(&"b".into()).unwrap();

        transport.emit_connectivity(ConnectivityState::Failed);
        transport.emit_connectivity(ConnectivityState::Closed);
        h.manager.process_pending();
        h.manager
            .handle_envelope(SignalingEnvelope::PeerLeft { peer: "b".into() })
            .unwrap();
        assert!(!h.manager.remove_peer(&"b".into(), "again"));

        assert_eq!(lefts(&mut h.notifications), vec!["b"]);
        assert_eq!(*watch.borrow_and_update(), PeerState::Disconnected);
        assert_eq!(h.manager.peer_count(), 0);
        settle().await;
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn remote_media_announces_once_per_session() {
        let mut h = harness();
        h.manager
            .handle_envelope(SignalingEnvelope::PeerJoined { peer: "b".into() })
            .unwrap();
        let transport = h.factory.wait_for_transport(&"b".into()).await;
        transport.emit_remote_media(MediaKind::Audio);
        transport.emit_remote_media(MediaKind::Video);
        h.manager.process_pending();

        let mut joined = 0;
        while let Ok(notification) = h.notifications.try_recv() {
            if matches!(notification, Notification::Joined { .. }) {
                joined += 1;
            }
        }
        assert_eq!(joined, 1);
    }

    #[tokio::test]
    async fn events_from_a_replaced_session_are_ignored() {
        let mut h = harness();
        h.manager
            .handle_envelope(SignalingEnvelope::PeerJoined { peer: "b".into() })
            .unwrap();
        let old = h.factory.wait_for_transport(&"b".into()).await;
        h.manager
            .handle_envelope(SignalingEnvelope::PeerLeft { peer: "b".into() })
            .unwrap();
        h.manager
            .handle_envelope(SignalingEnvelope::PeerJoined { peer: "b".into() })
            .unwrap();
        let _ = lefts(&mut h.notifications);

        old.emit_connectivity(ConnectivityState::Failed);
        old.emit_remote_media(MediaKind::Video);
        h.manager.process_pending();
        assert_eq!(h.manager.peer_count(), 1);
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_tears_down_everything_once() {
        let mut h = harness();
        for peer in ["a", "b", "c"] {
            h.manager
                .handle_envelope(SignalingEnvelope::PeerJoined { peer: peer.into() })
                .unwrap();
        }
        h.manager.shutdown("test");
        h.manager.shutdown("test");
        assert!(h.manager.is_closed());
        assert_eq!(h.manager.peer_count(), 0);

        let mut left = Vec::new();
        let mut errors = 0;
        while let Ok(notification) = h.notifications.try_recv() {
            match notification {
                Notification::Left { peer } => left.push(peer.to_string()),
                Notification::Error { .. } => errors += 1,
                Notification::Joined { .. } => {}
            }
        }
        left.sort();
        assert_eq!(left, vec!["a", "b", "c"]);
        assert_eq!(errors, 1);

        h.manager
            .handle_envelope(SignalingEnvelope::PeerJoined { peer: "d".into() })
            .unwrap();
        assert_eq!(h.manager.peer_count(), 0);
    }

    async fn pump_until(manager: &mut SessionManager, done: impl Fn(&SessionManager) -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !done(manager) {
                manager.process_pending();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition in time");
    }

    #[tokio::test]
    async fn terminal_connectivity_closes_the_transport_from_the_session() {
        let mut h = harness();
        h.manager
            .handle_envelope(SignalingEnvelope::PeerJoined { peer: "b".into() })
            .unwrap();
        let transport = h.factory.wait_for_transport(&"b".into()).await;
        let mut watch = h.manager.watch_peer(&"b".into()).unwrap();

        transport.emit_connectivity(ConnectivityState::Connected);
        h.manager.process_pending();
        settle().await;
        assert_eq!(h.manager.peer_count(), 1);
        assert!(!transport.is_closed());

        transport.emit_connectivity(ConnectivityState::Disconnected);
        pump_until(&mut h.manager, |m| m.peer_count() == 0).await;
        settle().await;

        assert_eq!(*watch.borrow_and_update(), PeerState::Disconnected);
        assert_eq!(transport.calls(), vec![MockCall::Close]);
        let mut left = Vec::new();
        while let Ok(notification) = h.notifications.try_recv() {
            match notification {
                Notification::Left { peer } => left.push(peer.to_string()),
                Notification::Error { message } => panic!("unexpected error {message}"),
                Notification::Joined { .. } => {}
            }
        }
        assert_eq!(left, vec!["b"]);
    }

    #[tokio::test]
    async fn removal_during_open_still_closes_the_transport() {
        let mut h = harness();
        let gate = h.factory.gate_open_for("b");
        h.manager
            .handle_envelope(SignalingEnvelope::PeerJoined { peer: "b".into() })
            .unwrap();
        settle().await;
        assert_eq!(h.factory.opened_count(), 0);

        assert!(h.manager.remove_peer(&"b".into(), "peer left"));
        assert_eq!(lefts(&mut h.notifications), vec!["b"]);

        gate.add_permits(1);
        let transport = h.factory.wait_for_transport(&"b".into()).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !transport.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("transport closed");
        assert_eq!(transport.calls(), vec![MockCall::Close]);
        assert_eq!(h.manager.peer_count(), 0);
    }
}
