use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ChatMessage;
use crate::presence::{PresenceStatus, PresenceUpdate};
use crate::user::User;
use crate::voice::{
    IceCandidate, IceServer, SessionDescription, VoiceParticipant, VoiceStateUpdate,
};

// Lifecycle opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_HELLO: u8 = 1;
pub const OP_READY: u8 = 2;
pub const OP_RESUMED: u8 = 3;
pub const OP_INVALID_SESSION: u8 = 4;
pub const OP_RECONNECT: u8 = 5;

/// The `{op, t?, d?, s?}` envelope carried by every gateway frame.
///
/// Lifecycle frames use `op` alone; `op = 0` (DISPATCH) carries a `t` type
/// tag and `d` payload, and server->client dispatches additionally carry a
/// monotonically increasing per-connection sequence number `s`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
}

// ── Client -> server dispatches ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Identify {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSet {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageSend {
    pub content: String,
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct VoiceJoin {
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct VoiceStateSet {
    #[serde(default)]
    pub muted: Option<bool>,
    #[serde(default)]
    pub deafened: Option<bool>,
    #[serde(default)]
    pub speaking: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScreenShareSubscribe {
    pub streamer_id: i64,
}

/// Every client->server dispatch, decoded once at the protocol boundary.
/// No business logic ever sees a raw JSON value.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
    Identify(Identify),
    PresenceSet(PresenceSet),
    MessageSend(MessageSend),
    Typing,
    VoiceJoin(VoiceJoin),
    VoiceLeave,
    RtcOffer(SessionDescription),
    RtcAnswer(SessionDescription),
    RtcIceCandidate(IceCandidate),
    VoiceStateSet(VoiceStateSet),
    ScreenShareStart,
    ScreenShareStop,
    ScreenShareSubscribe(ScreenShareSubscribe),
    ScreenShareUnsubscribe,
}

impl ClientCommand {
    /// Rebuild a typed command from an already-parsed envelope.
    pub fn from_envelope(msg: &GatewayMessage) -> Result<Self, DecodeError> {
        if msg.op != OP_DISPATCH {
            return Err(DecodeError::UnexpectedOpcode(msg.op));
        }
        let t = msg.t.as_deref().ok_or(DecodeError::MissingType)?;
        let mut tagged = serde_json::Map::new();
        tagged.insert("t".into(), Value::String(t.to_string()));
        if let Some(d) = &msg.d {
            tagged.insert("d".into(), d.clone());
        }
        serde_json::from_value(Value::Object(tagged))
            .map_err(|e| DecodeError::Payload(t.to_string(), e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedOpcode(u8),
    MissingType,
    Payload(String, String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedOpcode(op) => write!(f, "unexpected opcode {op}"),
            Self::MissingType => write!(f, "dispatch frame without a type tag"),
            Self::Payload(t, err) => write!(f, "bad {t} payload: {err}"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ── Server -> client dispatches ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TypingEvent {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserLeft {
    pub user_id: i64,
}

/// One entry of the READY member snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub user: User,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceStateUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ready {
    pub session_id: String,
    pub user: User,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RtcReady {
    pub participants: Vec<VoiceParticipant>,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceSpeaking {
    pub user_id: i64,
    pub speaking: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreenShareUpdate {
    pub user_id: i64,
    pub streaming: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RtcSignal {
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

/// Every server->client dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    PresenceUpdate(PresenceUpdate),
    MessageCreate(ChatMessage),
    TypingStart(TypingEvent),
    TypingStop(TypingEvent),
    UserUpdate(User),
    UserJoined(Member),
    UserLeft(UserLeft),
    VoiceStateUpdate(VoiceStateUpdate),
    RtcReady(RtcReady),
    RtcOffer(RtcSignal),
    RtcAnswer(RtcSignal),
    RtcIceCandidate(RtcSignal),
    VoiceSpeaking(VoiceSpeaking),
    ScreenShareUpdate(ScreenShareUpdate),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PresenceUpdate(_) => "PRESENCE_UPDATE",
            Self::MessageCreate(_) => "MESSAGE_CREATE",
            Self::TypingStart(_) => "TYPING_START",
            Self::TypingStop(_) => "TYPING_STOP",
            Self::UserUpdate(_) => "USER_UPDATE",
            Self::UserJoined(_) => "USER_JOINED",
            Self::UserLeft(_) => "USER_LEFT",
            Self::VoiceStateUpdate(_) => "VOICE_STATE_UPDATE",
            Self::RtcReady(_) => "RTC_READY",
            Self::RtcOffer(_) => "RTC_OFFER",
            Self::RtcAnswer(_) => "RTC_ANSWER",
            Self::RtcIceCandidate(_) => "RTC_ICE_CANDIDATE",
            Self::VoiceSpeaking(_) => "VOICE_SPEAKING",
            Self::ScreenShareUpdate(_) => "SCREEN_SHARE_UPDATE",
            Self::Error(_) => "ERROR",
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    NotAuthenticated,
    DecodeError,
    RateLimited,
    MessageTooLong,
    VoiceJoinCooldown,
    VoiceStateCooldown,
    VoiceJoinFailed,
    NotInVoice,
    VoiceNegotiationFailed,
    VoiceNegotiationTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Milliseconds until the rejected action may be retried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            nonce: None,
            retry_after: None,
        }
    }

    pub fn with_nonce(mut self, nonce: Option<String>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_retry_after(mut self, millis: u64) -> Self {
        self.retry_after = Some(millis);
        self
    }
}
