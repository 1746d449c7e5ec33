//! Signaling wire types
//!
//! [`SignalingEnvelope`] is the unit exchanged between the two negotiation
//! engines and is carried verbatim by every transport. [`ChannelEvent`] is the
//! persistent channel's frame format; the `relay_api` module's request and
//! response bodies live at the bottom of this file.

use crate::media::TrackKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque room identifier shared by both participants
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Participant role in a consultation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Doctor,
    Patient,
}

impl Role {
    /// The role on the other side of the call
    pub fn counterpart(self) -> Role {
        match self {
            Role::Doctor => Role::Patient,
            Role::Patient => Role::Doctor,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Doctor => f.write_str("doctor"),
            Role::Patient => f.write_str("patient"),
        }
    }
}

/// Identity assigned by the relay on authentication or join
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantIdentity {
    pub user_id: String,
    pub role: Role,
}

/// What the caller supplies to join a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantContext {
    /// Appointment the room belongs to
    pub appointment_id: String,

    /// Role the caller joins as
    pub role: Role,
}

/// Result of a successful room join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    /// Our identity in the room
    pub identity: ParticipantIdentity,

    /// Whether the other participant was already in the room when we joined
    pub peer_present: bool,
}

// ============================================================================
// Envelope
// ============================================================================

/// Envelope type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    VideoState,
    AudioState,
    Keepalive,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description in the browser JSON shape (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Advisory payload of `video-state` / `audio-state` envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStatePayload {
    pub enabled: bool,
}

/// A negotiation message between the two engines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,

    #[serde(default)]
    pub payload: serde_json::Value,

    pub sender_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    /// Milliseconds since the Unix epoch at creation
    pub timestamp: f64,
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

impl SignalingEnvelope {
    fn new(kind: SignalKind, sender_id: &str, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            sender_id: sender_id.to_string(),
            target_id: None,
            timestamp: now_millis(),
        }
    }

    pub fn offer(sender_id: &str, desc: &SessionDescription) -> Result<Self> {
        Ok(Self::new(
            SignalKind::Offer,
            sender_id,
            serde_json::to_value(desc)?,
        ))
    }

    pub fn answer(sender_id: &str, desc: &SessionDescription) -> Result<Self> {
        Ok(Self::new(
            SignalKind::Answer,
            sender_id,
            serde_json::to_value(desc)?,
        ))
    }

    pub fn candidate(sender_id: &str, candidate: &IceCandidate) -> Result<Self> {
        Ok(Self::new(
            SignalKind::Candidate,
            sender_id,
            serde_json::to_value(candidate)?,
        ))
    }

    pub fn media_state(sender_id: &str, kind: TrackKind, enabled: bool) -> Self {
        let signal_kind = match kind {
            TrackKind::Audio => SignalKind::AudioState,
            TrackKind::Video => SignalKind::VideoState,
        };
        Self::new(
            signal_kind,
            sender_id,
            serde_json::json!({ "enabled": enabled }),
        )
    }

    pub fn keepalive(sender_id: &str) -> Self {
        Self::new(SignalKind::Keepalive, sender_id, serde_json::Value::Null)
    }

    /// Address the envelope to one participant
    pub fn with_target(mut self, target_id: Option<String>) -> Self {
        self.target_id = target_id;
        self
    }

    /// Decode an offer or answer payload
    pub fn description(&self) -> Result<SessionDescription> {
        let desc: SessionDescription = serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::SdpError(format!("Malformed session description: {}", e)))?;

        let expected = match self.kind {
            SignalKind::Offer => SdpType::Offer,
            SignalKind::Answer => SdpType::Answer,
            other => {
                return Err(Error::SdpError(format!(
                    "{:?} envelope carries no session description",
                    other
                )))
            }
        };
        if desc.sdp_type != expected {
            return Err(Error::SdpError(format!(
                "{:?} envelope carries a {:?} description",
                self.kind, desc.sdp_type
            )));
        }
        Ok(desc)
    }

    /// Decode a candidate payload
    pub fn ice_candidate(&self) -> Result<IceCandidate> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::IceCandidateError(format!("Malformed candidate: {}", e)))
    }

    /// Decode a `video-state`/`audio-state` payload
    pub fn media_state_payload(&self) -> Option<(TrackKind, bool)> {
        let kind = match self.kind {
            SignalKind::VideoState => TrackKind::Video,
            SignalKind::AudioState => TrackKind::Audio,
            _ => return None,
        };
        serde_json::from_value::<MediaStatePayload>(self.payload.clone())
            .ok()
            .map(|p| (kind, p.enabled))
    }

    /// True if `user_id` should process this envelope
    ///
    /// Relays may broadcast to the whole room, so our own envelopes and those
    /// addressed to someone else come back and must be ignored.
    pub fn is_for(&self, user_id: &str) -> bool {
        if self.sender_id == user_id {
            return false;
        }
        match &self.target_id {
            Some(target) => target == user_id,
            None => true,
        }
    }
}

// ============================================================================
// Persistent channel frames
// ============================================================================

/// `webrtc_signal` frame body, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFrame {
    /// Set by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    /// Set by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    /// Set by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,

    /// Set by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_role: Option<Role>,

    pub signal: SignalingEnvelope,
}

/// Persistent channel frame: `{"event": <name>, "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChannelEvent {
    Connected {
        #[serde(default)]
        sid: Option<String>,
    },
    Authenticate {
        token: String,
    },
    Authenticated {
        #[serde(default)]
        status: Option<String>,
        user_id: String,
        user_role: Role,
    },
    AuthError {
        error: String,
    },
    JoinRoom {
        room_id: String,
    },
    RoomJoined {
        room_id: String,
        #[serde(default)]
        status: Option<String>,
    },
    RoomError {
        error: String,
    },
    LeaveRoom {
        room_id: String,
    },
    WebrtcSignal(SignalFrame),
    UserJoined {
        user_id: String,
        user_role: Role,
    },
    UserLeft {
        user_id: String,
    },
    SignalError {
        error: String,
    },
}

impl ChannelEvent {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

// ============================================================================
// Relay REST bodies
// ============================================================================

/// `POST /rooms/{roomId}/join` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub appointment_id: String,
}

/// `POST /rooms/{roomId}/join` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub user_id: String,
}

/// `POST /rooms/{roomId}/signal` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub signal: SignalingEnvelope,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

/// One stored signal as returned by the poll endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    pub user_id: String,

    #[serde(default)]
    pub user_role: Option<Role>,

    /// Relay clock, seconds since the Unix epoch
    pub timestamp: f64,

    pub signal: SignalingEnvelope,

    #[serde(default)]
    pub target_id: Option<String>,
}

/// `GET /rooms/{roomId}/messages?since=` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub messages: Vec<RelayRecord>,

    /// Relay clock at response time; the next poll's `since`
    pub server_time: f64,
}

/// `GET /rooms/{roomId}/status` response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub has_active_call: bool,
    pub doctor_joined: bool,
    pub patient_joined: bool,
}

impl RoomStatus {
    /// Whether a participant with `role` is in the room
    pub fn is_present(&self, role: Role) -> bool {
        match role {
            Role::Doctor => self.doctor_joined,
            Role::Patient => self.patient_joined,
        }
    }
}
