use async_trait::async_trait;
use mesh_protocol::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::{API, APIBuilder};
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::rtp_transceiver::RTCRtpTransceiver;
use ::webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use ::webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use ::webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use ::webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use ::webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectivityState, MediaTrack, OfferOptions, PeerTransport, RemoteMedia, TransportError,
    TransportEventKind, TransportEventSink, TransportFactory,
};
use crate::media::{LocalMedia, LocalTrackSpec, MediaKind};

/// Opens `webrtc` peer connections. Local tracks are created once per
/// capture track and bound to every peer connection.
pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api,
            ice_servers,
            local_tracks: Mutex::new(HashMap::new()),
        })
    }

    /// The shared outbound track for `desc`. Capture code writes samples here.
    pub fn local_track(&self, desc: &LocalTrackSpec) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.local_tracks.lock();
        tracks
            .entry(desc.id.clone())
            .or_insert_with(|| {
                Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: desc.mime_type.clone(),
                        clock_rate: desc.clock_rate,
                        channels: desc.channels,
                        ..Default::default()
                    },
                    desc.id.clone(),
                    desc.stream_id.clone(),
                ))
            })
            .clone()
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn open(
        &self,
        media: &LocalMedia,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(setup_error)?,
        );

        for desc in media.tracks() {
            let track: Arc<dyn TrackLocal + Send + Sync> = self.local_track(desc);
            peer_connection
                .add_track(track)
                .await
                .map_err(setup_error)?;
        }

        let candidate_sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(TransportEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "mesh",
                            peer = %sink.peer(),
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let state_sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = state_sink.clone();
                Box::pin(async move {
                    tracing::debug!(
                        target = "mesh",
                        peer = %sink.peer(),
                        state = %state,
                        "peer connection state changed"
                    );
                    sink.emit(TransportEventKind::Connectivity(connectivity_from(state)));
                })
            },
        ));

        let track_sink = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                Box::pin(async move {
                    sink.emit(TransportEventKind::RemoteMedia(RemoteMedia::new(Arc::new(
                        RtcRemoteTrack { track },
                    ))));
                })
            },
        ));

        Ok(Arc::new(RtcPeerTransport {
            peer_connection,
            sends_audio: media.has_kind(MediaKind::Audio),
            sends_video: media.has_kind(MediaKind::Video),
            receivers_added: AtomicBool::new(false),
        }))
    }
}

struct RtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    sends_audio: bool,
    sends_video: bool,
    receivers_added: AtomicBool,
}

impl RtcPeerTransport {
    /// Kinds we want to receive but do not send need a recv-only
    /// transceiver, otherwise the offer carries no m-line for them.
    async fn ensure_receivers(&self, options: OfferOptions) -> Result<(), TransportError> {
        if self.receivers_added.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let wanted = [
            (options.receive_audio && !self.sends_audio, RTPCodecType::Audio),
            (options.receive_video && !self.sends_video, RTPCodecType::Video),
        ];
        for (needed, kind) in wanted {
            if !needed {
                continue;
            }
            self.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(negotiation_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError> {
        self.ensure_receivers(options).await?;
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(negotiation_error)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "mesh", error = %err, "peer connection close failed");
        }
    }
}

/// Remote track delivered by a `webrtc` peer connection.
pub struct RtcRemoteTrack {
    track: Arc<TrackRemote>,
}

impl RtcRemoteTrack {
    pub fn track(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl fmt::Debug for RtcRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcRemoteTrack")
            .field("id", &self.track.id())
            .field("stream_id", &self.track.stream_id())
            .finish()
    }
}

impl MediaTrack for RtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn kind(&self) -> MediaKind {
        match self.track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return Err(TransportError::Negotiation(
                "rollback descriptions are not supported".into(),
            ));
        }
    };
    result.map_err(negotiation_error)
}

fn connectivity_from(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectivityState::New,
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

fn setup_error(err: ::webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn negotiation_error(err: ::webrtc::Error) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sink(peer: &str) -> TransportEventSink {
        let (tx, _rx) = mpsc::unbounded_channel();
        TransportEventSink::new(peer.into(), 1, tx)
    }

    #[tokio::test]
    async fn receive_only_offer_requests_audio_and_video() {
        let factory = RtcTransportFactory::new(&[]).expect("factory");
        let transport = factory
            .open(&LocalMedia::default(), sink("remote"))
            .await
            .expect("open");
        let offer = transport
            .create_offer(OfferOptions::default())
            .await
            .expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        transport.close().await;
    }

    #[tokio::test]
    async fn local_tracks_are_shared_between_peers() {
        let factory = RtcTransportFactory::new(&[]).expect("factory");
        let spec = LocalTrackSpec::audio("local");
        let first = factory.local_track(&spec);
        let second = factory.local_track(&spec);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn maps_terminal_connection_states() {
        assert!(connectivity_from(RTCPeerConnectionState::Failed).is_terminal());
        assert!(connectivity_from(RTCPeerConnectionState::Disconnected).is_terminal());
        assert!(!connectivity_from(RTCPeerConnectionState::Connecting).is_terminal());
    }
}
