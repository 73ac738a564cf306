use serde::{Deserialize, Serialize};

/// Voice membership as broadcast in VOICE_STATE_UPDATE dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub user_id: i64,
    pub in_voice: bool,
    pub muted: bool,
    pub deafened: bool,
}

/// One current voice member, as listed in RTC_READY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceParticipant {
    pub user_id: i64,
    pub muted: bool,
    pub deafened: bool,
}

/// STUN/TURN server entry handed to the client in RTC_READY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// An SDP offer or answer body, relayed verbatim between client and relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}
