use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use lanyard_core::store::{MessageStore, UserStore};
use lanyard_models::gateway::{
    ClientCommand, ErrorCode, ErrorPayload, Identify, MessageSend, PresenceSet, Ready, ServerEvent,
    TypingEvent, VoiceJoin, VoiceStateSet,
};
use lanyard_models::presence::{PresenceStatus, PresenceUpdate};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::{Hub, HubError, RtcPayload, ScreenShareAction};
use crate::ratelimit::{MinInterval, SlidingWindow};
use crate::{GatewayConfig, GatewayContext};

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connected = 0,
    Identified = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connected,
            1 => Self::Identified,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

fn lifecycle_allowed(from: ConnState, to: ConnState) -> bool {
    use ConnState::*;
    matches!(
        (from, to),
        (Connected, Identified) | (Connected, Closing) | (Identified, Closing) | (Closing, Closed)
    )
}

/// Lock-free lifecycle cell. Transitions only move forward, so a failed CAS
/// always means someone else already advanced past `from`.
#[derive(Debug)]
pub struct LifecycleState(AtomicU8);

impl LifecycleState {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnState::Connected as u8))
    }

    pub fn get(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn advance(&self, from: ConnState, to: ConnState) -> bool {
        if !lifecycle_allowed(from, to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

// ── Outbound frames ──────────────────────────────────────────────────────────

/// What the write loop can put on the wire. Lifecycle frames carry no
/// sequence number; `Event` frames get one assigned at serialization time.
#[derive(Debug)]
pub enum OutboundFrame {
    Hello,
    Ready(Ready),
    InvalidSession { resumable: bool },
    /// Server is going away; the client should reconnect elsewhere.
    Reconnect,
    Event(ServerEvent),
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Shared face of one connection: the hub and other tasks talk to the
/// connection exclusively through this.
pub struct ConnectionHandle {
    outbound: mpsc::Sender<OutboundFrame>,
    dropped: AtomicU32,
    state: LifecycleState,
    closing: watch::Sender<bool>,
    identity: OnceLock<(i64, Uuid)>,
    presence: AtomicU8,
    drop_log_every: u32,
    drop_disconnect_threshold: u32,
}

impl ConnectionHandle {
    pub fn new(config: &GatewayConfig) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(config.outbound_capacity);
        let (closing, _) = watch::channel(false);
        let handle = Arc::new(Self {
            outbound: tx,
            dropped: AtomicU32::new(0),
            state: LifecycleState::new(),
            closing,
            identity: OnceLock::new(),
            presence: AtomicU8::new(presence_to_u8(PresenceStatus::Online)),
            drop_log_every: config.drop_log_every,
            drop_disconnect_threshold: config.drop_disconnect_threshold,
        });
        (handle, rx)
    }

    /// Non-blocking enqueue. A full queue drops the frame and counts it;
    /// a connection that keeps falling behind gets closed instead of
    /// stalling the sender.
    pub fn push(&self, frame: OutboundFrame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if self.drop_log_every > 0 && dropped % self.drop_log_every == 0 {
                    warn!(
                        user_id = self.user_id().unwrap_or(0),
                        dropped, "outbound queue full, dropping frames"
                    );
                }
                if dropped >= self.drop_disconnect_threshold {
                    warn!(
                        user_id = self.user_id().unwrap_or(0),
                        "connection too far behind, closing"
                    );
                    self.begin_close();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Move to Closing from whichever live state we are in. Idempotent;
    /// returns true only for the caller that actually performed the close.
    pub fn begin_close(&self) -> bool {
        loop {
            match self.state.get() {
                ConnState::Connected if self.state.advance(ConnState::Connected, ConnState::Closing) => break,
                ConnState::Identified if self.state.advance(ConnState::Identified, ConnState::Closing) => break,
                ConnState::Connected | ConnState::Identified => continue,
                ConnState::Closing | ConnState::Closed => return false,
            }
        }
        let _ = self.closing.send(true);
        true
    }

    pub fn finish_close(&self) -> bool {
        self.state.advance(ConnState::Closing, ConnState::Closed)
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state.get(), ConnState::Closing | ConnState::Closed)
    }

    pub fn closing_watch(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub fn identity(&self) -> Option<(i64, Uuid)> {
        self.identity.get().copied()
    }

    pub fn user_id(&self) -> Option<i64> {
        self.identity.get().map(|(id, _)| *id)
    }

    pub fn presence(&self) -> PresenceStatus {
        u8_to_presence(self.presence.load(Ordering::Relaxed))
    }

    pub fn set_presence(&self, status: PresenceStatus) {
        self.presence.store(presence_to_u8(status), Ordering::Relaxed);
    }

    fn set_identity(&self, user_id: i64, session_id: Uuid) -> bool {
        self.identity.set((user_id, session_id)).is_ok()
    }
}

fn presence_to_u8(status: PresenceStatus) -> u8 {
    match status {
        PresenceStatus::Online => 0,
        PresenceStatus::Idle => 1,
        PresenceStatus::Dnd => 2,
        PresenceStatus::Offline => 3,
    }
}

fn u8_to_presence(v: u8) -> PresenceStatus {
    match v {
        0 => PresenceStatus::Online,
        1 => PresenceStatus::Idle,
        2 => PresenceStatus::Dnd,
        _ => PresenceStatus::Offline,
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

/// Per-socket actor state. Owned by the read loop; rate limiters live here
/// so no locking is involved in enforcing them.
pub struct Connection {
    pub handle: Arc<ConnectionHandle>,
    hub: Hub,
    users: Arc<dyn UserStore>,
    messages: Arc<dyn MessageStore>,
    config: Arc<GatewayConfig>,
    msg_limiter: MinInterval,
    join_limiter: SlidingWindow,
    relief_limiter: SlidingWindow,
}

impl Connection {
    pub fn new(ctx: &GatewayContext) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (handle, rx) = ConnectionHandle::new(&ctx.config);
        let conn = Self {
            handle,
            hub: ctx.hub.clone(),
            users: ctx.users.clone(),
            messages: ctx.messages.clone(),
            config: ctx.config.clone(),
            msg_limiter: MinInterval::new(ctx.config.message_min_interval),
            join_limiter: SlidingWindow::new(ctx.config.voice_join_window),
            relief_limiter: SlidingWindow::new(ctx.config.voice_relief_window),
        };
        (conn, rx)
    }

    pub fn send_hello(&self) {
        self.handle.push(OutboundFrame::Hello);
    }

    fn push_error(&self, payload: ErrorPayload) {
        self.handle.push(OutboundFrame::Event(ServerEvent::Error(payload)));
    }

    fn require_identity(&self) -> Option<(i64, Uuid)> {
        match self.handle.identity() {
            Some(identity) => Some(identity),
            None => {
                self.push_error(ErrorPayload::new(
                    ErrorCode::NotAuthenticated,
                    "identify first",
                ));
                None
            }
        }
    }

    pub async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Identify(identify) => self.handle_identify(identify).await,
            ClientCommand::PresenceSet(set) => self.handle_presence_set(set).await,
            ClientCommand::MessageSend(send) => self.handle_message_send(send).await,
            ClientCommand::Typing => self.handle_typing().await,
            ClientCommand::VoiceJoin(join) => self.handle_voice_join(join).await,
            ClientCommand::VoiceLeave => self.handle_voice_leave().await,
            ClientCommand::RtcOffer(sdp) => self.handle_rtc(RtcPayload::Offer(sdp)).await,
            ClientCommand::RtcAnswer(sdp) => self.handle_rtc(RtcPayload::Answer(sdp)).await,
            ClientCommand::RtcIceCandidate(candidate) => {
                self.handle_rtc(RtcPayload::Candidate(candidate)).await
            }
            ClientCommand::VoiceStateSet(set) => self.handle_voice_state_set(set).await,
            ClientCommand::ScreenShareStart => {
                self.handle_screen_share(ScreenShareAction::Start).await
            }
            ClientCommand::ScreenShareStop => {
                self.handle_screen_share(ScreenShareAction::Stop).await
            }
            ClientCommand::ScreenShareSubscribe(sub) => {
                self.handle_screen_share(ScreenShareAction::Subscribe(sub.streamer_id))
                    .await
            }
            ClientCommand::ScreenShareUnsubscribe => {
                self.handle_screen_share(ScreenShareAction::Unsubscribe).await
            }
        }
    }

    async fn handle_identify(&mut self, identify: Identify) {
        if self.handle.identity().is_some() {
            debug!("duplicate IDENTIFY ignored");
            return;
        }
        let claims = match lanyard_core::auth::validate_token(&identify.token, &self.config.jwt_secret)
        {
            Ok(claims) => claims,
            Err(err) => {
                debug!(error = %err, "identify rejected");
                self.push_error(ErrorPayload::new(ErrorCode::AuthFailed, "invalid token"));
                self.handle.begin_close();
                return;
            }
        };
        let user = match self.users.find_by_id(claims.sub).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.push_error(ErrorPayload::new(ErrorCode::AuthFailed, "unknown user"));
                self.handle.begin_close();
                return;
            }
            Err(err) => {
                warn!(error = %err, "user lookup failed during identify");
                self.push_error(ErrorPayload::new(ErrorCode::AuthFailed, "lookup failed"));
                self.handle.begin_close();
                return;
            }
        };

        if !self.handle.state.advance(ConnState::Connected, ConnState::Identified) {
            return;
        }
        let session_id = Uuid::new_v4();
        self.handle.set_identity(user.id, session_id);

        let members = match tokio::time::timeout(
            self.config.register_timeout,
            self.hub.register(user.clone(), self.handle.clone()),
        )
        .await
        {
            Ok(Ok(members)) => members,
            Ok(Err(err)) => {
                warn!(user_id = user.id, error = %err, "hub registration failed");
                self.push_error(ErrorPayload::new(ErrorCode::AuthFailed, "registration failed"));
                self.handle.begin_close();
                return;
            }
            Err(_) => {
                warn!(user_id = user.id, "hub registration timed out");
                self.push_error(ErrorPayload::new(ErrorCode::AuthFailed, "registration timed out"));
                self.handle.begin_close();
                return;
            }
        };

        self.handle.push(OutboundFrame::Ready(Ready {
            session_id: session_id.to_string(),
            user,
            members,
        }));
    }

    async fn handle_presence_set(&mut self, set: PresenceSet) {
        let Some((user_id, _)) = self.require_identity() else {
            return;
        };
        self.handle.set_presence(set.status);
        self.hub
            .broadcast(
                ServerEvent::PresenceUpdate(PresenceUpdate {
                    user_id,
                    status: set.status,
                }),
                None,
            )
            .await;
    }

    async fn handle_message_send(&mut self, send: MessageSend) {
        let Some((user_id, _)) = self.require_identity() else {
            return;
        };
        // Validation rejects must not consume a rate slot, so the length cap
        // comes before the limiter.
        if send.content.chars().count() > self.config.max_message_len {
            self.push_error(
                ErrorPayload::new(ErrorCode::MessageTooLong, "message exceeds length limit")
                    .with_nonce(send.nonce),
            );
            return;
        }
        if let Err(wait) = self.msg_limiter.check(Instant::now()) {
            self.push_error(
                ErrorPayload::new(ErrorCode::RateLimited, "sending messages too fast")
                    .with_nonce(send.nonce)
                    .with_retry_after(wait.as_millis() as u64),
            );
            return;
        }

        // Sending a message implicitly ends the author's typing state.
        self.hub
            .broadcast(
                ServerEvent::TypingStop(TypingEvent { user_id }),
                Some(user_id),
            )
            .await;

        let mut message = match self.messages.create(user_id, &send.content).await {
            Ok(message) => message,
            Err(err) => {
                warn!(user_id, error = %err, "failed to persist message");
                return;
            }
        };
        message.nonce = send.nonce;
        self.hub
            .broadcast(ServerEvent::MessageCreate(message), None)
            .await;
    }

    async fn handle_typing(&mut self) {
        let Some((user_id, _)) = self.require_identity() else {
            return;
        };
        self.hub
            .broadcast(
                ServerEvent::TypingStart(TypingEvent { user_id }),
                Some(user_id),
            )
            .await;
    }

    async fn handle_voice_join(&mut self, join: VoiceJoin) {
        let Some((user_id, _)) = self.require_identity() else {
            return;
        };
        if let Err(wait) = self.join_limiter.check(Instant::now()) {
            self.push_error(
                ErrorPayload::new(ErrorCode::VoiceJoinCooldown, "joining voice too often")
                    .with_retry_after(wait.as_millis() as u64),
            );
            return;
        }
        match self
            .hub
            .voice_join(self.handle.clone(), join.muted, join.deafened)
            .await
        {
            Ok(()) => {}
            Err(HubError::Stale) => {
                debug!(user_id, "voice join from superseded connection ignored");
            }
            Err(err) => {
                debug!(user_id, error = %err, "voice join rejected");
                self.push_error(ErrorPayload::new(
                    ErrorCode::VoiceJoinFailed,
                    "could not join voice",
                ));
            }
        }
    }

    async fn handle_voice_leave(&mut self) {
        let Some((user_id, _)) = self.require_identity() else {
            return;
        };
        match self.hub.voice_leave(self.handle.clone()).await {
            Ok(()) | Err(HubError::Stale) => {}
            Err(err) => {
                debug!(user_id, error = %err, "voice leave rejected");
                self.push_error(ErrorPayload::new(ErrorCode::NotInVoice, "not in voice"));
            }
        }
    }

    async fn handle_voice_state_set(&mut self, set: VoiceStateSet) {
        let Some((user_id, _)) = self.require_identity() else {
            return;
        };
        if let Some(speaking) = set.speaking {
            match self.hub.voice_speaking(self.handle.clone(), speaking).await {
                Ok(()) | Err(HubError::Stale) => {}
                Err(_) => {
                    self.push_error(ErrorPayload::new(ErrorCode::NotInVoice, "not in voice"));
                    return;
                }
            }
        }
        if set.muted.is_none() && set.deafened.is_none() {
            return;
        }
        // Muting is always allowed; clearing mute or deafen is limited so a
        // client cannot strobe audibility.
        let relief = set.muted == Some(false) || set.deafened == Some(false);
        if relief {
            if let Err(wait) = self.relief_limiter.check(Instant::now()) {
                self.push_error(
                    ErrorPayload::new(ErrorCode::VoiceStateCooldown, "changing voice state too often")
                        .with_retry_after(wait.as_millis() as u64),
                );
                return;
            }
        }
        if let Err(err) = self
            .hub
            .voice_set_flags(self.handle.clone(), set.muted, set.deafened)
            .await
        {
            debug!(user_id, error = %err, "voice state change rejected");
            self.push_error(ErrorPayload::new(ErrorCode::NotInVoice, "not in voice"));
        }
    }

    async fn handle_rtc(&mut self, payload: RtcPayload) {
        let Some(_) = self.require_identity() else {
            return;
        };
        if let Err(HubError::NotInVoice) = self.hub.forward_rtc(self.handle.clone(), payload).await {
            self.push_error(ErrorPayload::new(ErrorCode::NotInVoice, "not in voice"));
        }
    }

    async fn handle_screen_share(&mut self, action: ScreenShareAction) {
        let Some(_) = self.require_identity() else {
            return;
        };
        if let Err(HubError::NotInVoice) = self.hub.screen_share(self.handle.clone(), action).await {
            self.push_error(ErrorPayload::new(ErrorCode::NotInVoice, "not in voice"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let state = LifecycleState::new();
        assert_eq!(state.get(), ConnState::Connected);
        assert!(state.advance(ConnState::Connected, ConnState::Identified));
        assert!(state.advance(ConnState::Identified, ConnState::Closing));
        assert!(state.advance(ConnState::Closing, ConnState::Closed));
        assert_eq!(state.get(), ConnState::Closed);
    }

    #[test]
    fn lifecycle_rejects_backwards_and_skips() {
        let state = LifecycleState::new();
        assert!(!state.advance(ConnState::Connected, ConnState::Closed));
        assert!(state.advance(ConnState::Connected, ConnState::Closing));
        assert!(!state.advance(ConnState::Closing, ConnState::Identified));
        assert!(!state.advance(ConnState::Closing, ConnState::Connected));
    }

    #[test]
    fn begin_close_fires_once() {
        let config = GatewayConfig::default();
        let (handle, _rx) = ConnectionHandle::new(&config);
        assert!(handle.begin_close());
        assert!(!handle.begin_close());
        assert_eq!(handle.state(), ConnState::Closing);
        assert!(handle.finish_close());
        assert!(!handle.finish_close());
    }

    #[test]
    fn close_watch_observes_close() {
        let config = GatewayConfig::default();
        let (handle, _rx) = ConnectionHandle::new(&config);
        let watch = handle.closing_watch();
        assert!(!*watch.borrow());
        handle.begin_close();
        assert!(*watch.borrow());
    }

    #[test]
    fn push_drops_when_full_and_closes_at_threshold() {
        let config = GatewayConfig {
            outbound_capacity: 1,
            drop_disconnect_threshold: 3,
            ..GatewayConfig::default()
        };
        let (handle, _rx) = ConnectionHandle::new(&config);
        assert!(handle.push(OutboundFrame::Hello));
        assert!(!handle.push(OutboundFrame::Hello));
        assert!(!handle.push(OutboundFrame::Hello));
        assert_eq!(handle.state(), ConnState::Connected);
        assert!(!handle.push(OutboundFrame::Hello));
        assert_eq!(handle.state(), ConnState::Closing);
    }

    #[test]
    fn drop_logging_can_be_disabled() {
        let config = GatewayConfig {
            outbound_capacity: 1,
            drop_log_every: 0,
            drop_disconnect_threshold: 2,
            ..GatewayConfig::default()
        };
        let (handle, _rx) = ConnectionHandle::new(&config);
        assert!(handle.push(OutboundFrame::Hello));
        assert!(!handle.push(OutboundFrame::Hello));
        assert!(!handle.push(OutboundFrame::Hello));
        assert_eq!(handle.state(), ConnState::Closing);
    }
}
