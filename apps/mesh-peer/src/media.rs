use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const MIME_TYPE_OPUS: &str = "audio/opus";
pub const MIME_TYPE_VP8: &str = "video/VP8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Description of one captured track offered to every peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrackSpec {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
}

impl LocalTrackSpec {
    pub fn audio(stream_id: &str) -> Self {
        Self {
            id: format!("{stream_id}-audio"),
            stream_id: stream_id.to_string(),
            kind: MediaKind::Audio,
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48_000,
            channels: 2,
        }
    }

    pub fn video(stream_id: &str) -> Self {
        Self {
            id: format!("{stream_id}-video"),
            stream_id: stream_id.to_string(),
            kind: MediaKind::Video,
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90_000,
            channels: 0,
        }
    }
}

/// The local capture handle. Acquired once and shared read-only by every
/// peer session.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Arc<Vec<LocalTrackSpec>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrackSpec>) -> Self {
        Self {
            tracks: Arc::new(tracks),
        }
    }

    pub fn tracks(&self) -> &[LocalTrackSpec] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|track| track.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media device unavailable: {0}")]
    Unavailable(String),
    #[error("media permission denied")]
    PermissionDenied,
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, MediaError>;
}

/// Describes an Opus audio track and a VP8 video track without touching
/// capture hardware. Samples are written into the transport's local tracks by
/// whatever owns the capture pipeline.
#[derive(Debug, Clone)]
pub struct StaticMediaSource {
    pub stream_id: String,
    pub audio: bool,
    pub video: bool,
}

impl StaticMediaSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        let mut tracks = Vec::new();
        if self.audio {
            tracks.push(LocalTrackSpec::audio(&self.stream_id));
        }
        if self.video {
            tracks.push(LocalTrackSpec::video(&self.stream_id));
        }
        Ok(LocalMedia::new(tracks))
    }
}
