// Wire protocol for the relay channel
// Every frame is a JSON envelope: {type, roomId, seq?, ...payload}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while framing or parsing envelopes
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP blob as exchanged by browsers: `{type, sdp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// Body of a `message` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    /// Client-generated id, matched against the optimistic copy on echo
    #[serde(default)]
    pub id: Option<String>,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub sender_avatar: Option<String>,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Everything that can travel over the channel, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    Message(ChatPayload),

    #[serde(rename_all = "camelCase")]
    Typing { user_name: String, is_typing: bool },

    #[serde(rename = "video-call-offer", rename_all = "camelCase")]
    CallOffer {
        offer: SessionDescription,
        caller_name: String,
    },

    #[serde(rename = "video-call-answer")]
    CallAnswer { answer: SessionDescription },

    IceCandidate { candidate: IceCandidate },

    #[serde(rename = "video-call-end")]
    CallEnd,

    #[serde(rename = "video-call-reject")]
    CallReject,

    #[serde(rename_all = "camelCase")]
    JoinRoom {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },

    LeaveRoom,
}

impl Event {
    /// Wire name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Message(_) => "message",
            Event::Typing { .. } => "typing",
            Event::CallOffer { .. } => "video-call-offer",
            Event::CallAnswer { .. } => "video-call-answer",
            Event::IceCandidate { .. } => "ice-candidate",
            Event::CallEnd => "video-call-end",
            Event::CallReject => "video-call-reject",
            Event::JoinRoom { .. } => "join-room",
            Event::LeaveRoom => "leave-room",
        }
    }

    /// Membership frames are consumed by the relay and never fanned out
    pub fn is_membership(&self) -> bool {
        matches!(self, Event::JoinRoom { .. } | Event::LeaveRoom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub room_id: String,
    /// Per-room sequence number stamped by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    pub fn new(room_id: impl Into<String>, event: Event) -> Self {
        Self {
            room_id: room_id.into(),
            seq: None,
            event,
        }
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}
