use mesh_protocol::ParticipantId;
use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::transport::RemoteMedia;

/// UI-facing callbacks. `peer_joined` and `peer_left` fire at most once per
/// session.
pub trait PeerNotifier: Send + Sync {
    fn peer_joined(&self, peer: &ParticipantId, media: RemoteMedia);
    fn peer_left(&self, peer: &ParticipantId);
    fn error(&self, _error: &MeshError) {}
}

/// Reports everything through `tracing`. Used by the CLI, which has no
/// renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl PeerNotifier for LoggingNotifier {
    fn peer_joined(&self, peer: &ParticipantId, media: RemoteMedia) {
        tracing::info!(
            target = "mesh",
            peer = %peer,
            stream = %media.stream_id(),
            kind = %media.track.kind(),
            "peer joined"
        );
    }

    fn peer_left(&self, peer: &ParticipantId) {
        tracing::info!(target = "mesh", peer = %peer, "peer left");
    }

    fn error(&self, error: &MeshError) {
        tracing::error!(target = "mesh", error = %error, "mesh error");
    }
}

#[derive(Debug, Clone)]
pub enum Notification {
    Joined {
        peer: ParticipantId,
        media: RemoteMedia,
    },
    Left {
        peer: ParticipantId,
    },
    Error {
        message: String,
    },
}

/// Forwards notifications into a channel so a caller can consume them
/// asynchronously.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PeerNotifier for ChannelNotifier {
    fn peer_joined(&self, peer: &ParticipantId, media: RemoteMedia) {
        let _ = self.tx.send(Notification::Joined {
            peer: peer.clone(),
            media,
        });
    }

    fn peer_left(&self, peer: &ParticipantId) {
        let _ = self.tx.send(Notification::Left { peer: peer.clone() });
    }

    fn error(&self, error: &MeshError) {
        let _ = self.tx.send(Notification::Error {
            message: error.to_string(),
        });
    }
}
