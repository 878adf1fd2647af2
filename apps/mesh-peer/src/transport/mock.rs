use async_trait::async_trait;
use mesh_protocol::{IceCandidate, ParticipantId, SessionDescription};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

use super::{
    ConnectivityState, MediaTrack, OfferOptions, PeerTransport, RemoteMedia, TransportError,
    TransportEventKind, TransportEventSink, TransportFactory,
};
use crate::media::{LocalMedia, MediaKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer(OfferOptions),
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

/// In-memory transport factory. Every transport it opens records the calls
/// made on it and behaves like a real stack in one respect: candidates are
/// rejected until a remote description is set.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    inner: Arc<Mutex<FactoryState>>,
    opened: Arc<Notify>,
}

#[derive(Default)]
struct FactoryState {
    transports: Vec<Arc<MockTransport>>,
    fail_open: HashSet<ParticipantId>,
    fail_negotiation: HashSet<ParticipantId>,
    gates: HashMap<ParticipantId, Arc<Semaphore>>,
    open_gates: HashMap<ParticipantId, Arc<Semaphore>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open_for(&self, peer: impl Into<ParticipantId>) {
        self.inner.lock().fail_open.insert(peer.into());
    }

    /// Make offer and answer creation fail for this peer.
    pub fn fail_negotiation_for(&self, peer: impl Into<ParticipantId>) {
        self.inner.lock().fail_negotiation.insert(peer.into());
    }

    /// Hold offer and answer creation for this peer until permits are added
    /// to the returned semaphore.
    pub fn gate_negotiation_for(&self, peer: impl Into<ParticipantId>) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.inner.lock().gates.insert(peer.into(), gate.clone());
        gate
    }

    /// Hold `open` itself for this peer until a permit is added.
    pub fn gate_open_for(&self, peer: impl Into<ParticipantId>) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.inner.lock().open_gates.insert(peer.into(), gate.clone());
        gate
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.inner.lock().transports.clone()
    }

    /// Most recently opened transport for `peer`.
    pub fn transport(&self, peer: &ParticipantId) -> Option<Arc<MockTransport>> {
        self.inner
            .lock()
            .transports
            .iter()
            .rev()
            .find(|transport| transport.peer() == peer)
            .cloned()
    }

    pub fn opened_count(&self) -> usize {
        self.inner.lock().transports.len()
    }

    pub async fn wait_for_transport(&self, peer: &ParticipantId) -> Arc<MockTransport> {
        loop {
            let notified = self.opened.notified();
            if let Some(transport) = self.transport(peer) {
                return transport;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(
        &self,
        media: &LocalMedia,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let gate = self.inner.lock().open_gates.get(events.peer()).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let transport = {
            let mut state = self.inner.lock();
            if state.fail_open.contains(events.peer()) {
                return Err(TransportError::Setup(format!(
                    "mock open refused for {}",
                    events.peer()
                )));
            }
            let transport = Arc::new(MockTransport {
                fail_negotiation: state.fail_negotiation.contains(events.peer()),
                gate: state.gates.get(events.peer()).cloned(),
                local_tracks: media.tracks().len(),
                events,
                state: Mutex::new(MockState::default()),
            });
            state.transports.push(transport.clone());
            transport
        };
        self.opened.notify_waiters();
        Ok(transport)
    }
}

pub struct MockTransport {
    events: TransportEventSink,
    fail_negotiation: bool,
    gate: Option<Arc<Semaphore>>,
    local_tracks: usize,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    closed: bool,
}

impl MockTransport {
    pub fn peer(&self) -> &ParticipantId {
        self.events.peer()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn local_track_count(&self) -> usize {
        self.local_tracks
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) -> bool {
        self.events
            .emit(TransportEventKind::LocalCandidate(candidate))
    }

    pub fn emit_connectivity(&self, state: ConnectivityState) -> bool {
        self.events.emit(TransportEventKind::Connectivity(state))
    }

    pub fn emit_remote_media(&self, kind: MediaKind) -> bool {
        let track = MockTrack {
            id: format!("{}-{kind}", self.peer()),
            stream_id: self.peer().to_string(),
            kind,
        };
        self.events
            .emit(TransportEventKind::RemoteMedia(RemoteMedia::new(Arc::new(track))))
    }

    fn record(&self, call: MockCall) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.calls.push(call);
        Ok(())
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError> {
        self.pass_gate().await;
        self.record(MockCall::CreateOffer(options))?;
        if self.fail_negotiation {
            return Err(TransportError::Negotiation("mock offer failure".into()));
        }
        Ok(SessionDescription::offer(format!(
            "mock-offer to={} audio={} video={}",
            self.peer(),
            options.receive_audio,
            options.receive_video
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.pass_gate().await;
        self.record(MockCall::CreateAnswer)?;
        if self.fail_negotiation {
            return Err(TransportError::Negotiation("mock answer failure".into()));
        }
        if self.state.lock().remote.is_none() {
            return Err(TransportError::Negotiation(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(SessionDescription::answer(format!("mock-answer to={}", self.peer())))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetLocal(description.clone()))?;
        self.state.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetRemote(description.clone()))?;
        self.state.lock().remote = Some(description);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.state.lock().remote.is_none() {
            return Err(TransportError::Candidate(
                "remote description not set".into(),
            ));
        }
        self.record(MockCall::AddCandidate(candidate.clone()))?;
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.calls.push(MockCall::Close);
            state.closed = true;
        }
    }
}

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    stream_id: String,
    kind: MediaKind,
}

impl MediaTrack for MockTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
