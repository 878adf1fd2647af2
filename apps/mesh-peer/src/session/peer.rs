use mesh_protocol::{IceCandidate, ParticipantId, SessionDescription, SignalingEnvelope};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::media::LocalMedia;
use crate::signaling::{SignalingError, SignalingSender};
use crate::transport::{
    ConnectivityState, OfferOptions, PeerTransport, TransportError, TransportEvent,
    TransportEventSink, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    New,
    OfferSent,
    OfferReceived,
    AnswerPending,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Creates the offer. Always the side that joined later.
    Initiator,
    Responder,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Initiator => f.write_str("initiator"),
            PeerRole::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unexpected {signal} for {role} session in state {state:?}")]
    UnexpectedSignal {
        signal: &'static str,
        role: PeerRole,
        state: PeerState,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl SessionError {
    /// Whether the session can no longer make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

/// Move the published state forward. `Disconnected` is never left.
pub(crate) fn publish(state: &watch::Sender<PeerState>, next: PeerState) -> bool {
    state.send_if_modified(|current| {
        if *current == PeerState::Disconnected || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

/// Negotiation state for one remote participant.
pub struct PeerSession {
    peer: ParticipantId,
    role: PeerRole,
    transport: Arc<dyn PeerTransport>,
    signaling: SignalingSender,
    state: Arc<watch::Sender<PeerState>>,
    local_description_set: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

impl PeerSession {
    pub fn new(
        peer: ParticipantId,
        role: PeerRole,
        transport: Arc<dyn PeerTransport>,
        signaling: SignalingSender,
    ) -> Self {
        let (state, _) = watch::channel(PeerState::New);
        Self::with_state(peer, role, transport, signaling, Arc::new(state))
    }

    pub(crate) fn with_state(
        peer: ParticipantId,
        role: PeerRole,
        transport: Arc<dyn PeerTransport>,
        signaling: SignalingSender,
        state: Arc<watch::Sender<PeerState>>,
    ) -> Self {
        Self {
            peer,
            role,
            transport,
            signaling,
            state,
            local_description_set: false,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub async fn start_offer(&mut self, options: OfferOptions) -> Result<(), SessionError> {
        self.expect(PeerRole::Initiator, PeerState::New, "offer request")?;
        let offer = self.transport.create_offer(options).await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.local_description_set = true;
        self.advance(PeerState::OfferSent);
        self.signaling.send(SignalingEnvelope::Offer {
            peer: self.peer.clone(),
            offer,
        })?;
        self.advance(PeerState::AnswerPending);
        tracing::debug!(target = "mesh", peer = %self.peer, "offer sent");
        Ok(())
    }

    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), SessionError> {
        self.expect(PeerRole::Responder, PeerState::New, "offer")?;
        self.advance(PeerState::OfferReceived);
        self.apply_remote_description(offer).await?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.local_description_set = true;
        self.signaling.send(SignalingEnvelope::Answer {
            peer: self.peer.clone(),
            answer,
        })?;
        self.advance(PeerState::Connected);
        tracing::debug!(target = "mesh", peer = %self.peer, "answer sent");
        Ok(())
    }

    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), SessionError> {
        self.expect(PeerRole::Initiator, PeerState::AnswerPending, "answer")?;
        self.apply_remote_description(answer).await?;
        self.advance(PeerState::Connected);
        tracing::debug!(target = "mesh", peer = %self.peer, "answer applied");
        Ok(())
    }

    /// Applies the candidate once a remote description exists, buffers it
    /// otherwise.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        let state = self.state();
        if state == PeerState::Disconnected {
            return Err(SessionError::UnexpectedSignal {
                signal: "candidate",
                role: self.role,
                state,
            });
        }
        if self.remote_description_set {
            self.apply_candidate(candidate).await;
        } else {
            self.pending_candidates.push_back(candidate);
            tracing::trace!(
                target = "mesh",
                peer = %self.peer,
                pending = self.pending_candidates.len(),
                "buffered remote candidate"
            );
        }
        Ok(())
    }

    pub fn send_local_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.signaling.send(SignalingEnvelope::Candidate {
            peer: self.peer.clone(),
            candidate,
        })?;
        Ok(())
    }

    /// Returns true when the transport state ends the session.
    pub fn on_connectivity(&mut self, state: ConnectivityState) -> bool {
        if state.is_terminal() {
            self.advance(PeerState::Disconnected);
            return true;
        }
        false
    }

    pub async fn close(&mut self) {
        self.advance(PeerState::Disconnected);
        self.pending_candidates.clear();
        self.transport.close().await;
    }

    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.transport.set_remote_description(description).await?;
        self.remote_description_set = true;
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(err) = self.transport.add_candidate(candidate).await {
            tracing::warn!(
                target = "mesh",
                peer = %self.peer,
                error = %err,
                "remote candidate rejected"
            );
        }
    }

    fn advance(&self, next: PeerState) {
        if publish(&self.state, next) {
            tracing::trace!(target = "mesh", peer = %self.peer, state = ?next, "peer state");
        }
    }

    fn expect(
        &self,
        role: PeerRole,
        state: PeerState,
        signal: &'static str,
    ) -> Result<(), SessionError> {
        let current = self.state();
        if self.role != role || current != state {
            return Err(SessionError::UnexpectedSignal {
                signal,
                role: self.role,
                state: current,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum PeerCommand {
    StartOffer(OfferOptions),
    Offer(SessionDescription),
    Answer(SessionDescription),
    RemoteCandidate(IceCandidate),
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
}

/// A session that cannot continue, reported back to the manager.
#[derive(Debug)]
pub(crate) struct SessionFailure {
    pub peer: ParticipantId,
    pub generation: u64,
    pub cause: FailureCause,
}

#[derive(Debug)]
pub(crate) enum FailureCause {
    Negotiation(SessionError),
    /// The transport reported a terminal state and has already been closed.
    ConnectionLost(ConnectivityState),
}

pub(crate) type TransportSlot = Arc<Mutex<Option<Arc<dyn PeerTransport>>>>;

pub(crate) struct PeerTaskContext {
    pub peer: ParticipantId,
    pub generation: u64,
    pub role: PeerRole,
    pub factory: Arc<dyn TransportFactory>,
    pub media: LocalMedia,
    pub signaling: SignalingSender,
    pub state: Arc<watch::Sender<PeerState>>,
    pub transport: TransportSlot,
    pub transport_events: mpsc::UnboundedSender<TransportEvent>,
    pub failures: mpsc::UnboundedSender<SessionFailure>,
}

impl PeerTaskContext {
    fn fail(&self, cause: FailureCause) {
        let _ = self.failures.send(SessionFailure {
            peer: self.peer.clone(),
            generation: self.generation,
            cause,
        });
    }
}

/// Body of the per-peer task. Commands are handled strictly in order.
pub(crate) async fn run_peer_task(
    ctx: PeerTaskContext,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let sink = TransportEventSink::new(
        ctx.peer.clone(),
        ctx.generation,
        ctx.transport_events.clone(),
    );
    let transport = match ctx.factory.open(&ctx.media, sink).await {
        Ok(transport) => transport,
        Err(err) => {
            ctx.fail(FailureCause::Negotiation(err.into()));
            return;
        }
    };

    // Whoever finds the session already removed closes the transport.
    let removed = {
        let mut slot = ctx.transport.lock();
        if *ctx.state.borrow() == PeerState::Disconnected {
            true
        } else {
            *slot = Some(Arc::clone(&transport));
            false
        }
    };
    if removed {
        transport.close().await;
        return;
    }

    let mut session = PeerSession::with_state(
        ctx.peer.clone(),
        ctx.role,
        transport,
        ctx.signaling.clone(),
        Arc::clone(&ctx.state),
    );
    tracing::debug!(
        target = "mesh",
        peer = %ctx.peer,
        generation = ctx.generation,
        role = %ctx.role,
        "peer session started"
    );

    while let Some(command) = commands.recv().await {
        let result = match command {
            PeerCommand::StartOffer(options) => session.start_offer(options).await,
            PeerCommand::Offer(offer) => session.accept_offer(offer).await,
            PeerCommand::Answer(answer) => session.accept_answer(answer).await,
            PeerCommand::RemoteCandidate(candidate) => {
                session.add_remote_candidate(candidate).await
            }
            PeerCommand::LocalCandidate(candidate) => session.send_local_candidate(candidate),
            PeerCommand::Connectivity(state) => {
                if session.on_connectivity(state) {
                    // The manager may already be tearing this session down.
                    let owned = ctx.transport.lock().take().is_some();
                    if owned {
                        session.close().await;
                    }
                    ctx.fail(FailureCause::ConnectionLost(state));
                    break;
                }
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                tracing::warn!(
                    target = "mesh",
                    peer = %ctx.peer,
                    generation = ctx.generation,
                    error = %err,
                    "peer negotiation failed"
                );
                ctx.fail(FailureCause::Negotiation(err));
                break;
            }
            Err(err) => {
                tracing::warn!(
                    target = "mesh",
                    peer = %ctx.peer,
                    error = %err,
                    "dropping signal"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockCall, MockTransport, MockTransportFactory};
    use mesh_protocol::SdpKind;

    async fn session(role: PeerRole) -> (PeerSession, Arc<MockTransport>, crate::signaling::Outbox) {
        let factory = MockTransportFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .open(&LocalMedia::default(), TransportEventSink::new("b".into(), 1, tx))
            .await
            .unwrap();
        let (signaling, outbox) = SignalingSender::detached();
        let mock = factory.transport(&"b".into()).unwrap();
        (
            PeerSession::new("b".into(), role, transport, signaling),
            mock,
            outbox,
        )
    }

    #[tokio::test]
    async fn initiator_sends_one_offer_and_waits_for_answer() {
        let (mut session, mock, mut outbox) = session(PeerRole::Initiator).await;
        session.start_offer(OfferOptions::default()).await.unwrap();
        assert_eq!(session.state(), PeerState::AnswerPending);
        assert!(session.local_description_set());

        let sent = outbox.drain();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            SignalingEnvelope::Offer { peer, offer } if peer.as_str() == "b" && offer.kind == SdpKind::Offer
        ));

        session
            .accept_answer(SessionDescription::answer("remote"))
            .await
            .unwrap();
        assert_eq!(session.state(), PeerState::Connected);
        assert_eq!(
            mock.remote_description(),
            Some(SessionDescription::answer("remote"))
        );
    }

    #[tokio::test]
    async fn responder_answers_offer() {
        let (mut session, mock, mut outbox) = session(PeerRole::Responder).await;
        session
            .accept_offer(SessionDescription::offer("remote"))
            .await
            .unwrap();
        assert_eq!(session.state(), PeerState::Connected);
        assert!(session.local_description_set());
        assert!(session.remote_description_set());
        assert!(matches!(
            outbox.drain().as_slice(),
            [SignalingEnvelope::Answer { .. }]
        ));
        assert_eq!(mock.local_description().map(|d| d.kind), Some(SdpKind::Answer));
    }

    #[tokio::test]
    async fn early_candidates_are_flushed_in_order_after_remote_description() {
        let (mut session, mock, _outbox) = session(PeerRole::Responder).await;
        for n in 0..3 {
            session
                .add_remote_candidate(IceCandidate::new(format!("candidate:{n}")))
                .await
                .unwrap();
        }
        assert_eq!(session.pending_candidates(), 3);
        assert!(mock.applied_candidates().is_empty());

        session
            .accept_offer(SessionDescription::offer("remote"))
            .await
            .unwrap();
        assert_eq!(session.pending_candidates(), 0);
        let applied: Vec<_> = mock
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:0", "candidate:1", "candidate:2"]);

        let calls = mock.calls();
        let remote_at = calls
            .iter()
            .position(|c| matches!(c, MockCall::SetRemote(_)))
            .unwrap();
        let answer_at = calls
            .iter()
            .position(|c| matches!(c, MockCall::CreateAnswer))
            .unwrap();
        for (index, call) in calls.iter().enumerate() {
            if matches!(call, MockCall::AddCandidate(_)) {
                assert!(index > remote_at && index < answer_at);
            }
        }

        session
            .add_remote_candidate(IceCandidate::new("candidate:late"))
            .await
            .unwrap();
        assert_eq!(mock.applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn wrong_role_or_state_is_rejected() {
        let (mut initiator, _, mut outbox) = session(PeerRole::Initiator).await;
        let err = initiator
            .accept_offer(SessionDescription::offer("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedSignal { signal: "offer", .. }));
        assert!(!err.is_fatal());

        let err = initiator
            .accept_answer(SessionDescription::answer("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::UnexpectedSignal {
                state: PeerState::New,
                ..
            }
        ));
        assert!(outbox.drain().is_empty());
    }

    #[tokio::test]
    async fn disconnected_is_terminal() {
        let (mut session, mock, _outbox) = session(PeerRole::Initiator).await;
        let mut watch = session.watch();
        assert!(session.on_connectivity(ConnectivityState::Failed));
        assert_eq!(session.state(), PeerState::Disconnected);
        assert!(watch.has_changed().unwrap());
        let _ = watch.borrow_and_update();

        session.advance(PeerState::Connected);
        assert_eq!(session.state(), PeerState::Disconnected);
        assert!(!watch.has_changed().unwrap());

        assert!(session
            .start_offer(OfferOptions::default())
            .await
            .is_err());
        assert!(session
            .add_remote_candidate(IceCandidate::new("candidate:0"))
            .await
            .is_err());
        session.close().await;
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn transport_failures_are_fatal() {
        let factory = MockTransportFactory::new();
        factory.fail_negotiation_for("b");
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .open(&LocalMedia::default(), TransportEventSink::new("b".into(), 1, tx))
            .await
            .unwrap();
        let (signaling, mut outbox) = SignalingSender::detached();
        let mut session = PeerSession::new("b".into(), PeerRole::Initiator, transport, signaling);
        let err = session
            .start_offer(OfferOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(outbox.drain().is_empty());
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_verbatim() {
        let (session, _mock, mut outbox) = session(PeerRole::Responder).await;
        let mut candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        session.send_local_candidate(candidate.clone()).unwrap();
        assert_eq!(
            outbox.drain(),
            vec![SignalingEnvelope::Candidate {
                peer: "b".into(),
                candidate
            }]
        );
    }
}
