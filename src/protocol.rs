use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised while decoding an inbound frame
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Envelope is missing a string \"type\"")]
    MissingType,

    #[error("Unknown or malformed message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Inbound messages (participant/host -> coordinator).
///
/// Wire form is `{ "type": "<kebab-case>", "payload": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    RegisterAsHost {},
    RequestToSpeak {},
    CancelRequest {},
    ReleaseFloor {},
    /// Alias of `release-floor`
    FinishedSpeaking {},
    SpeakingStarted {},
    // Host-only messages
    AdminKickUser {
        uid: Uid,
    },
    AdminRemoveRequest {
        uid: Uid,
    },
    AdminToggleSession {
        active: bool,
    },
    AdminReleaseFloor {},
    AdminUnkickUser {
        uid: Uid,
    },
    AdminGrantFloor {
        uid: Uid,
    },
    // Negotiation relay (payloads are opaque)
    WebrtcOffer(SignalPayload),
    WebrtcAnswer(SignalPayload),
    WebrtcIceCandidate(SignalPayload),
    Ping {},
    LatencyUpdate {
        rtt: f64,
    },
    WebrtcStats {
        #[serde(default)]
        rtt: Option<f64>,
        #[serde(default)]
        jitter: Option<f64>,
        #[serde(default)]
        packet_loss: Option<f64>,
    },
}

impl ClientMessage {
    /// Decode a text frame. A missing or null payload is read as `{}`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut value: Value = serde_json::from_str(text)?;
        let envelope = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;

        if !envelope.get("type").is_some_and(Value::is_string) {
            return Err(ProtocolError::MissingType);
        }
        match envelope.get("payload") {
            None | Some(Value::Null) => {
                envelope.insert("payload".to_string(), Value::Object(Map::new()));
            }
            Some(_) => {}
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Short name used in logs and authorization errors
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RegisterAsHost {} => "register-as-host",
            ClientMessage::RequestToSpeak {} => "request-to-speak",
            ClientMessage::CancelRequest {} => "cancel-request",
            ClientMessage::ReleaseFloor {} => "release-floor",
            ClientMessage::FinishedSpeaking {} => "finished-speaking",
            ClientMessage::SpeakingStarted {} => "speaking-started",
            ClientMessage::AdminKickUser { .. } => "admin-kick-user",
            ClientMessage::AdminRemoveRequest { .. } => "admin-remove-request",
            ClientMessage::AdminToggleSession { .. } => "admin-toggle-session",
            ClientMessage::AdminReleaseFloor {} => "admin-release-floor",
            ClientMessage::AdminUnkickUser { .. } => "admin-unkick-user",
            ClientMessage::AdminGrantFloor { .. } => "admin-grant-floor",
            ClientMessage::WebrtcOffer(_) => "webrtc-offer",
            ClientMessage::WebrtcAnswer(_) => "webrtc-answer",
            ClientMessage::WebrtcIceCandidate(_) => "webrtc-ice-candidate",
            ClientMessage::Ping {} => "ping",
            ClientMessage::LatencyUpdate { .. } => "latency-update",
            ClientMessage::WebrtcStats { .. } => "webrtc-stats",
        }
    }
}

/// Opaque negotiation payload. Only `targetUid` is ever inspected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub Map<String, Value>);

impl SignalPayload {
    pub fn target_uid(&self) -> Option<&str> {
        self.0.get("targetUid").and_then(Value::as_str)
    }

    /// Tag the payload with the uid of the participant it came from
    pub fn with_sender(mut self, uid: &str) -> Self {
        self.0
            .insert("fromUid".to_string(), Value::String(uid.to_string()));
        self
    }
}

/// Outbound messages (coordinator -> participant/host)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Initial snapshot sent right after admission
    SystemWelcome {
        uid: Uid,
        display_name: String,
        email: String,
        picture: Option<String>,
        is_host: bool,
        session_active: bool,
        speaker: Option<ParticipantView>,
    },
    SystemSessionStatus {
        active: bool,
    },
    SystemSpeakerUpdate {
        speaker: Option<ParticipantView>,
    },
    /// Host-only: connected non-privileged participants
    SystemParticipantList {
        participants: Vec<ParticipantView>,
    },
    /// Host-only: pending floor requests in FIFO order
    SystemRequestQueue {
        queue: Vec<QueueView>,
    },
    /// Host-only: banned identities
    SystemBannedList {
        banned_list: Vec<ParticipantView>,
    },
    SystemSpeakGranted {},
    SystemRequestAcknowledged {
        position: usize,
    },
    SystemRequestCancelled {},
    SystemRequestRemoved {},
    /// Host-only: a participant just asked for the floor
    SystemStudentRequest {
        uid: Uid,
        name: String,
        email: String,
    },
    /// Sent right before a banned connection is closed
    SystemKicked {
        message: String,
    },
    SystemError {
        message: String,
    },
    WebrtcOffer(SignalPayload),
    WebrtcAnswer(SignalPayload),
    WebrtcIceCandidate(SignalPayload),
    Pong {},
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::SystemError {
            message: message.into(),
        }
    }
}
