//! Wire schema for the mesh signaling relay.
//!
//! Every frame on the relay connection is a JSON object of the form
//! `{ "msg_type": ..., "token": ..., "content": ... }`. Outbound, `token`
//! names the participant the envelope is addressed to; the relay rewrites it
//! to the sender's id before delivery, so inbound `token` always names the
//! remote peer the envelope concerns.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Opaque participant identifier. Accepts JSON strings or numbers on input
/// and always serializes as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for the local participant.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Unsigned(value) => Self(value.to_string()),
            RawId::Signed(value) => Self(value.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinAnnounce,
    PeerJoined,
    PeerLeft,
    Candidate,
    Offer,
    Answer,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::JoinAnnounce => "JOIN_ANNOUNCE",
            MessageKind::PeerJoined => "PEER_JOINED",
            MessageKind::PeerLeft => "PEER_LEFT",
            MessageKind::Candidate => "CANDIDATE",
            MessageKind::Offer => "OFFER",
            MessageKind::Answer => "ANSWER",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "JOIN_ANNOUNCE" | "I_JOIN" => Ok(MessageKind::JoinAnnounce),
            "PEER_JOINED" | "OTHER_JOIN" => Ok(MessageKind::PeerJoined),
            "PEER_LEFT" => Ok(MessageKind::PeerLeft),
            "CANDIDATE" => Ok(MessageKind::Candidate),
            "OFFER" => Ok(MessageKind::Offer),
            "ANSWER" => Ok(MessageKind::Answer),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged by browsers: `{ "type": ..., "sdp": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network reachability descriptor, forwarded verbatim between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Untyped frame exactly as it travels over the relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    /// Older relays put the join roster here instead of in `content`.
    #[serde(default, rename = "tokenList", skip_serializing_if = "Option::is_none")]
    pub token_list: Option<Vec<ParticipantId>>,
}

#[derive(Serialize, Deserialize)]
struct OfferContent {
    offer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct AnswerContent {
    answer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct CandidateContent {
    icecandidate: IceCandidate,
}

/// Typed signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEnvelope {
    /// Delivered once to a newcomer with everyone already present.
    JoinAnnounce { roster: Vec<ParticipantId> },
    /// Broadcast to existing participants when someone arrives.
    PeerJoined { peer: ParticipantId },
    PeerLeft { peer: ParticipantId },
    Candidate {
        peer: ParticipantId,
        candidate: IceCandidate,
    },
    Offer {
        peer: ParticipantId,
        offer: SessionDescription,
    },
    Answer {
        peer: ParticipantId,
        answer: SessionDescription,
    },
}

impl SignalingEnvelope {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingEnvelope::JoinAnnounce { .. } => MessageKind::JoinAnnounce,
            SignalingEnvelope::PeerJoined { .. } => MessageKind::PeerJoined,
            SignalingEnvelope::PeerLeft { .. } => MessageKind::PeerLeft,
            SignalingEnvelope::Candidate { .. } => MessageKind::Candidate,
            SignalingEnvelope::Offer { .. } => MessageKind::Offer,
            SignalingEnvelope::Answer { .. } => MessageKind::Answer,
        }
    }

    /// The remote participant this envelope concerns, if any.
    pub fn peer(&self) -> Option<&ParticipantId> {
        match self {
            SignalingEnvelope::JoinAnnounce { .. } => None,
            SignalingEnvelope::PeerJoined { peer }
            | SignalingEnvelope::PeerLeft { peer }
            | SignalingEnvelope::Candidate { peer, .. }
            | SignalingEnvelope::Offer { peer, .. }
            | SignalingEnvelope::Answer { peer, .. } => Some(peer),
        }
    }

    /// Replace the peer token. Relays use this to turn a target into a sender.
    pub fn with_peer(self, peer: ParticipantId) -> Self {
        match self {
            SignalingEnvelope::JoinAnnounce { roster } => SignalingEnvelope::JoinAnnounce { roster },
            SignalingEnvelope::PeerJoined { .. } => SignalingEnvelope::PeerJoined { peer },
            SignalingEnvelope::PeerLeft { .. } => SignalingEnvelope::PeerLeft { peer },
            SignalingEnvelope::Candidate { candidate, .. } => {
                SignalingEnvelope::Candidate { peer, candidate }
            }
            SignalingEnvelope::Offer { offer, .. } => SignalingEnvelope::Offer { peer, offer },
            SignalingEnvelope::Answer { answer, .. } => SignalingEnvelope::Answer { peer, answer },
        }
    }

    pub fn to_wire(&self) -> Result<WireEnvelope, ProtocolError> {
        let content = match self {
            SignalingEnvelope::JoinAnnounce { roster } => serde_json::to_value(roster)?,
            SignalingEnvelope::PeerJoined { .. } | SignalingEnvelope::PeerLeft { .. } => {
                Value::Null
            }
            SignalingEnvelope::Candidate { candidate, .. } => {
                serde_json::to_value(CandidateContent {
                    icecandidate: candidate.clone(),
                })?
            }
            SignalingEnvelope::Offer { offer, .. } => serde_json::to_value(OfferContent {
                offer: offer.clone(),
            })?,
            SignalingEnvelope::Answer { answer, .. } => serde_json::to_value(AnswerContent {
                answer: answer.clone(),
            })?,
        };
        Ok(WireEnvelope {
            msg_type: self.kind().as_str().to_string(),
            token: self.peer().cloned(),
            content,
            token_list: None,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_wire()?)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Self::try_from(wire)
    }
}

impl TryFrom<WireEnvelope> for SignalingEnvelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let kind: MessageKind = wire.msg_type.parse()?;
        let WireEnvelope {
            token,
            content,
            token_list,
            ..
        } = wire;
        let peer = |token: Option<ParticipantId>| token.ok_or(ProtocolError::MissingToken { kind });
        let invalid = |source| ProtocolError::InvalidContent { kind, source };

        Ok(match kind {
            MessageKind::JoinAnnounce => {
                let roster = match (content, token_list) {
                    (Value::Null, Some(list)) => list,
                    (Value::Null, None) => Vec::new(),
                    (other, _) => serde_json::from_value(other).map_err(invalid)?,
                };
                SignalingEnvelope::JoinAnnounce { roster }
            }
            MessageKind::PeerJoined => SignalingEnvelope::PeerJoined { peer: peer(token)? },
            MessageKind::PeerLeft => SignalingEnvelope::PeerLeft { peer: peer(token)? },
            MessageKind::Candidate => {
                let peer = peer(token)?;
                let content: CandidateContent = serde_json::from_value(content).map_err(invalid)?;
                SignalingEnvelope::Candidate {
                    peer,
                    candidate: content.icecandidate,
                }
            }
            MessageKind::Offer => {
                let peer = peer(token)?;
                let content: OfferContent = serde_json::from_value(content).map_err(invalid)?;
                SignalingEnvelope::Offer {
                    peer,
                    offer: content.offer,
                }
            }
            MessageKind::Answer => {
                let peer = peer(token)?;
                let content: AnswerContent = serde_json::from_value(content).map_err(invalid)?;
                SignalingEnvelope::Answer {
                    peer,
                    answer: content.answer,
                }
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),
    #[error("{kind} envelope is missing its peer token")]
    MissingToken { kind: MessageKind },
    #[error("invalid {kind} content: {source}")]
    InvalidContent {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}
