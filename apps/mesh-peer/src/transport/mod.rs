use async_trait::async_trait;
use mesh_protocol::{IceCandidate, ParticipantId, SessionDescription};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalMedia, MediaKind};

pub mod mock;
pub mod webrtc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("description negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("transport closed")]
    Closed,
}

/// What the local side asks to receive when it creates an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// States after which the peer is considered gone.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed | ConnectivityState::Closed
        )
    }
}

/// A remote track surfaced to the UI collaborator.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    /// Lets a renderer that knows the backend reach the concrete track.
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct RemoteMedia {
    pub track: Arc<dyn MediaTrack>,
}

impl RemoteMedia {
    pub fn new(track: Arc<dyn MediaTrack>) -> Self {
        Self { track }
    }

    pub fn stream_id(&self) -> String {
        self.track.stream_id()
    }
}

#[derive(Debug, Clone)]
pub enum TransportEventKind {
    /// Locally gathered candidate that must be relayed to the peer.
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    RemoteMedia(RemoteMedia),
}

#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub peer: ParticipantId,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Hands a transport a way to report events, tagged with the session they
/// belong to so stale reports can be told apart from live ones.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSink {
    pub fn new(peer: ParticipantId, generation: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once nobody is listening anymore.
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                peer: self.peer.clone(),
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// Peer connection primitive. Every call may suspend and every call may fail.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport for one remote participant. The local media is
    /// attached before any description is generated.
    async fn open(
        &self,
        media: &LocalMedia,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_disconnect_like_states_are_terminal() {
        assert!(ConnectivityState::Disconnected.is_terminal());
        assert!(ConnectivityState::Failed.is_terminal());
        assert!(ConnectivityState::Closed.is_terminal());
        assert!(!ConnectivityState::Connecting.is_terminal());
        assert!(!ConnectivityState::Connected.is_terminal());
    }

    #[test]
    fn sink_tags_events_with_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TransportEventSink::new("bob".into(), 7, tx);
        assert!(sink.emit(TransportEventKind::Connectivity(ConnectivityState::Connected)));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.peer.as_str(), "bob");
        assert_eq!(event.generation, 7);
        drop(rx);
        assert!(!sink.emit(TransportEventKind::Connectivity(ConnectivityState::Closed)));
    }
}
