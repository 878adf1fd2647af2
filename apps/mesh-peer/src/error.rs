use mesh_protocol::ProtocolError;
use thiserror::Error;

use crate::media::MediaError;
use crate::session::SessionError;
use crate::session::join::JoinError;
use crate::signaling::SignalingError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
