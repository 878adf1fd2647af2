//! In-process relay with the same contract as the WebSocket relay: a
//! newcomer receives the roster, everyone else hears about the newcomer, and
//! targeted envelopes are delivered with their token rewritten to the
//! sender.

use mesh_protocol::{ParticipantId, SignalingEnvelope};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ChannelEvent, Outbound, SignalingError, SignalingSender};

#[derive(Clone, Default)]
pub struct LocalRelay {
    inner: Arc<Mutex<RelayState>>,
}

#[derive(Default)]
struct RelayState {
    members: Vec<Member>,
}

struct Member {
    id: ParticipantId,
    sender: SignalingSender,
    events: mpsc::UnboundedSender<ChannelEvent>,
    pump: Option<JoinHandle<()>>,
}

impl Member {
    fn close(mut self, reason: &str) {
        if self.sender.mark_closed() {
            let _ = self.events.send(ChannelEvent::Closed {
                reason: reason.to_string(),
            });
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a participant. Must be called from within a tokio runtime.
    pub fn register(
        &self,
        id: impl Into<ParticipantId>,
    ) -> Result<(SignalingSender, mpsc::UnboundedReceiver<ChannelEvent>), SignalingError> {
        let id = id.into();
        let (sender, mut outbound) = SignalingSender::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut state = self.inner.lock();
        if state.members.iter().any(|member| member.id == id) {
            return Err(SignalingError::Connect(format!(
                "participant {id} is already registered"
            )));
        }

        let roster: Vec<ParticipantId> = state.members.iter().map(|m| m.id.clone()).collect();
        let _ = events_tx.send(ChannelEvent::Envelope(SignalingEnvelope::JoinAnnounce {
            roster,
        }));
        for member in &state.members {
            let _ = member
                .events
                .send(ChannelEvent::Envelope(SignalingEnvelope::PeerJoined {
                    peer: id.clone(),
                }));
        }

        let relay = self.clone();
        let from = id.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                match message {
                    Outbound::Envelope(envelope) => relay.route(&from, envelope),
                    Outbound::Ping => {}
                    Outbound::Close => {
                        relay.disconnect(&from);
                        break;
                    }
                }
            }
        });

        tracing::debug!(target = "mesh", peer = %id, members = state.members.len() + 1, "local relay member registered");
        state.members.push(Member {
            id,
            sender: sender.clone(),
            events: events_tx,
            pump: Some(pump),
        });
        Ok((sender, events_rx))
    }

    pub fn members(&self) -> Vec<ParticipantId> {
        self.inner.lock().members.iter().map(|m| m.id.clone()).collect()
    }

    /// Drop a participant as if its connection went away. The rest hear
    /// PEER_LEFT.
    pub fn disconnect(&self, id: &ParticipantId) -> bool {
        let mut state = self.inner.lock();
        let Some(index) = state.members.iter().position(|m| &m.id == id) else {
            return false;
        };
        let member = state.members.remove(index);
        member.close("disconnected from relay");
        for other in &state.members {
            let _ = other
                .events
                .send(ChannelEvent::Envelope(SignalingEnvelope::PeerLeft {
                    peer: id.clone(),
                }));
        }
        tracing::debug!(target = "mesh", peer = %id, "local relay member left");
        true
    }

    pub fn shutdown(&self) {
        let members = std::mem::take(&mut self.inner.lock().members);
        for member in members {
            member.close("relay shut down");
        }
    }

    fn route(&self, from: &ParticipantId, envelope: SignalingEnvelope) {
        let Some(target) = envelope.peer().cloned() else {
            tracing::debug!(target = "mesh", from = %from, kind = %envelope.kind(), "dropping untargeted envelope");
            return;
        };
        let state = self.inner.lock();
        match state.members.iter().find(|m| m.id == target) {
            Some(member) => {
                let _ = member
                    .events
                    .send(ChannelEvent::Envelope(envelope.with_peer(from.clone())));
            }
            None => {
                tracing::debug!(
                    target = "mesh",
                    from = %from,
                    to = %target,
                    kind = %envelope.kind(),
                    "dropping envelope for unknown participant"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_protocol::SessionDescription;

    fn expect_envelope(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> SignalingEnvelope {
        match rx.try_recv() {
            Ok(ChannelEvent::Envelope(envelope)) => envelope,
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn newcomer_receives_roster_and_others_hear_about_it() {
        let relay = LocalRelay::new();
        let (_a, mut a_rx) = relay.register("a").unwrap();
        assert_eq!(
            expect_envelope(&mut a_rx),
            SignalingEnvelope::JoinAnnounce { roster: vec![] }
        );

        let (_b, mut b_rx) = relay.register("b").unwrap();
        assert_eq!(
            expect_envelope(&mut b_rx),
            SignalingEnvelope::JoinAnnounce {
                roster: vec!["a".into()]
            }
        );
        assert_eq!(
            expect_envelope(&mut a_rx),
            SignalingEnvelope::PeerJoined { peer: "b".into() }
        );
        assert!(relay.register("b").is_err());
    }

    #[tokio::test]
    async fn targeted_envelopes_are_rewritten_to_the_sender() {
        let relay = LocalRelay::new();
        let (_a, mut a_rx) = relay.register("a").unwrap();
        let (b, _b_rx) = relay.register("b").unwrap();
        let _ = expect_envelope(&mut a_rx);
        let _ = expect_envelope(&mut a_rx);

        b.send(SignalingEnvelope::Offer {
            peer: "a".into(),
            offer: SessionDescription::offer("v=0"),
        })
        .unwrap();
        let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), a_rx.recv())
            .await
            .expect("delivery")
            .expect("open");
        match delivered {
            ChannelEvent::Envelope(SignalingEnvelope::Offer { peer, .. }) => {
                assert_eq!(peer.as_str(), "b")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_closes_the_member_and_notifies_the_rest() {
        let relay = LocalRelay::new();
        let (a, mut a_rx) = relay.register("a").unwrap();
        let (_b, mut b_rx) = relay.register("b").unwrap();
        let _ = expect_envelope(&mut b_rx);

        assert!(relay.disconnect(&"a".into()));
        assert!(!relay.disconnect(&"a".into()));
        assert!(!a.is_open());
        let mut closed = 0;
        while let Ok(event) = a_rx.try_recv() {
            if matches!(event, ChannelEvent::Closed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert_eq!(
            expect_envelope(&mut b_rx),
            SignalingEnvelope::PeerLeft { peer: "a".into() }
        );
        assert_eq!(relay.members(), vec![ParticipantId::new("b")]);
    }
}
