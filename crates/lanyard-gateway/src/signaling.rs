use async_trait::async_trait;
use lanyard_models::voice::{IceCandidate, SessionDescription};
use thiserror::Error;

/// Failure classes for relay calls. Transient errors are logged and the
/// session carries on; Fatal errors tear the voice session down.
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("relay connection closed")]
    Closed,
    #[error("transient relay error: {0}")]
    Transient(String),
    #[error("fatal relay error: {0}")]
    Fatal(String),
}

/// Events the relay raises back at the hub. Delivered over an mpsc channel
/// and drained in the hub's command loop, so handling is serialized with
/// everything else.
#[derive(Debug)]
pub enum SignalingEvent {
    /// Relay-initiated offer (renegotiation) for this user's connection.
    Offer { user_id: i64, sdp: SessionDescription },
    Answer { user_id: i64, sdp: SessionDescription },
    IceCandidate { user_id: i64, candidate: IceCandidate },
    /// The peer connection reached the connected state.
    PeerConnected { user_id: i64 },
    RenegotiationComplete { user_id: i64 },
    PeerError { user_id: i64, error: SignalingError },
}

/// Interface to the media relay's control plane.
#[async_trait]
pub trait SignalingBridge: Send + Sync {
    async fn add_peer(&self, user_id: i64) -> Result<(), SignalingError>;
    async fn remove_peer(&self, user_id: i64) -> Result<(), SignalingError>;
    async fn handle_offer(
        &self,
        user_id: i64,
        sdp: SessionDescription,
    ) -> Result<(), SignalingError>;
    async fn handle_answer(
        &self,
        user_id: i64,
        sdp: SessionDescription,
    ) -> Result<(), SignalingError>;
    async fn handle_ice_candidate(
        &self,
        user_id: i64,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;
    /// Ask the relay to renegotiate this user's connection, e.g. after a
    /// screen-share track change.
    async fn trigger_renegotiation(&self, user_id: i64) -> Result<(), SignalingError>;
    /// Ask a streamer's sender for a keyframe so a new viewer gets a clean
    /// first frame.
    async fn request_keyframe(&self, user_id: i64) -> Result<(), SignalingError>;
}
