use std::collections::HashMap;
use std::sync::Arc;

use lanyard_models::gateway::{
    ErrorCode, ErrorPayload, Member, RtcReady, RtcSignal, ScreenShareUpdate as ScreenShareEvent,
    ServerEvent, UserLeft, VoiceSpeaking,
};
use lanyard_models::presence::{PresenceStatus, PresenceUpdate};
use lanyard_models::user::User;
use lanyard_models::voice::{IceCandidate, SessionDescription, VoiceParticipant, VoiceStateUpdate};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, OutboundFrame};
use crate::screen_share::ScreenShareTracker;
use crate::signaling::{SignalingBridge, SignalingError, SignalingEvent};
use crate::voice::{VoiceSession, VoiceState};
use crate::GatewayConfig;

const HUB_QUEUE: usize = 512;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub unavailable")]
    Unavailable,
    #[error("request from a superseded connection")]
    Stale,
    #[error("already in a voice session")]
    AlreadyInVoice,
    #[error("media relay rejected the join")]
    JoinFailed,
    #[error("not in a voice session")]
    NotInVoice,
}

/// Client-originated RTC signaling, forwarded to the relay.
#[derive(Debug)]
pub enum RtcPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug)]
pub enum ScreenShareAction {
    Start,
    Stop,
    Subscribe(i64),
    Unsubscribe,
}

enum HubCommand {
    Register {
        user: User,
        handle: Arc<ConnectionHandle>,
        reply: oneshot::Sender<Vec<Member>>,
    },
    Deregister {
        handle: Arc<ConnectionHandle>,
    },
    Broadcast {
        event: ServerEvent,
        except: Option<i64>,
    },
    VoiceJoin {
        handle: Arc<ConnectionHandle>,
        muted: bool,
        deafened: bool,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    VoiceLeave {
        handle: Arc<ConnectionHandle>,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    VoiceSetFlags {
        handle: Arc<ConnectionHandle>,
        muted: Option<bool>,
        deafened: Option<bool>,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    VoiceSpeaking {
        handle: Arc<ConnectionHandle>,
        speaking: bool,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Rtc {
        handle: Arc<ConnectionHandle>,
        payload: RtcPayload,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    ScreenShare {
        handle: Arc<ConnectionHandle>,
        action: ScreenShareAction,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Shutdown,
}

struct Registered {
    user: User,
    handle: Arc<ConnectionHandle>,
}

#[derive(Default)]
struct Registry {
    by_user: HashMap<i64, Registered>,
    voice: HashMap<i64, VoiceSession>,
    screen: ScreenShareTracker,
}

struct HubShared {
    registry: RwLock<Registry>,
    config: Arc<GatewayConfig>,
}

/// Handle to the hub task. All mutation goes through the command channel,
/// so every state change is serialized; the shared registry lock exists only
/// for read-side snapshots.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
    shared: Arc<HubShared>,
}

impl Hub {
    pub fn spawn(
        config: Arc<GatewayConfig>,
        bridge: Arc<dyn SignalingBridge>,
        signaling_rx: mpsc::Receiver<SignalingEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(HUB_QUEUE);
        let shared = Arc::new(HubShared {
            registry: RwLock::new(Registry::default()),
            config: config.clone(),
        });
        let hub = Self {
            tx,
            shared: shared.clone(),
        };
        tokio::spawn(run_hub(shared, bridge, rx, signaling_rx));
        hub
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Unavailable)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| HubError::Unavailable)
    }

    /// Register an identified connection, evicting any previous connection
    /// for the same user. Resolves with the member snapshot for READY.
    pub async fn register(
        &self,
        user: User,
        handle: Arc<ConnectionHandle>,
    ) -> Result<Vec<Member>, HubError> {
        self.request(|reply| HubCommand::Register { user, handle, reply })
            .await
    }

    pub async fn deregister(&self, handle: Arc<ConnectionHandle>) {
        let _ = self.send(HubCommand::Deregister { handle }).await;
    }

    pub async fn broadcast(&self, event: ServerEvent, except: Option<i64>) {
        let _ = self.send(HubCommand::Broadcast { event, except }).await;
    }

    pub async fn voice_join(
        &self,
        handle: Arc<ConnectionHandle>,
        muted: bool,
        deafened: bool,
    ) -> Result<(), HubError> {
        self.request(|reply| HubCommand::VoiceJoin {
            handle,
            muted,
            deafened,
            reply,
        })
        .await?
    }

    pub async fn voice_leave(&self, handle: Arc<ConnectionHandle>) -> Result<(), HubError> {
        self.request(|reply| HubCommand::VoiceLeave { handle, reply })
            .await?
    }

    pub async fn voice_set_flags(
        &self,
        handle: Arc<ConnectionHandle>,
        muted: Option<bool>,
        deafened: Option<bool>,
    ) -> Result<(), HubError> {
        self.request(|reply| HubCommand::VoiceSetFlags {
            handle,
            muted,
            deafened,
            reply,
        })
        .await?
    }

    pub async fn voice_speaking(
        &self,
        handle: Arc<ConnectionHandle>,
        speaking: bool,
    ) -> Result<(), HubError> {
        self.request(|reply| HubCommand::VoiceSpeaking {
            handle,
            speaking,
            reply,
        })
        .await?
    }

    pub async fn forward_rtc(
        &self,
        handle: Arc<ConnectionHandle>,
        payload: RtcPayload,
    ) -> Result<(), HubError> {
        self.request(|reply| HubCommand::Rtc {
            handle,
            payload,
            reply,
        })
        .await?
    }

    pub async fn screen_share(
        &self,
        handle: Arc<ConnectionHandle>,
        action: ScreenShareAction,
    ) -> Result<(), HubError> {
        self.request(|reply| HubCommand::ScreenShare {
            handle,
            action,
            reply,
        })
        .await?
    }

    pub async fn shutdown(&self) {
        let _ = self.send(HubCommand::Shutdown).await;
    }

    pub async fn member_snapshot(&self) -> Vec<Member> {
        let registry = self.shared.registry.read().await;
        snapshot(&registry)
    }

    pub async fn online_count(&self) -> usize {
        self.shared.registry.read().await.by_user.len()
    }

    pub async fn is_registered(&self, user_id: i64) -> bool {
        self.shared.registry.read().await.by_user.contains_key(&user_id)
    }
}

// ── Hub task ─────────────────────────────────────────────────────────────────

async fn run_hub(
    shared: Arc<HubShared>,
    bridge: Arc<dyn SignalingBridge>,
    mut cmd_rx: mpsc::Receiver<HubCommand>,
    mut sig_rx: mpsc::Receiver<SignalingEvent>,
) {
    let config = shared.config.clone();
    let mut watchdog = tokio::time::interval(config.watchdog_interval);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sig_closed = false;

    info!("hub started");
    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(HubCommand::Shutdown) | None => {
                        let mut registry = shared.registry.write().await;
                        close_all(&mut registry, &bridge).await;
                        break;
                    }
                    Some(command) => {
                        let mut registry = shared.registry.write().await;
                        handle_command(&mut registry, command, &bridge, &config).await;
                    }
                }
            }
            event = sig_rx.recv(), if !sig_closed => {
                match event {
                    Some(event) => {
                        let mut registry = shared.registry.write().await;
                        handle_signaling(&mut registry, event, &bridge).await;
                    }
                    None => {
                        warn!("signaling event channel closed");
                        sig_closed = true;
                    }
                }
            }
            _ = watchdog.tick() => {
                let mut registry = shared.registry.write().await;
                sweep_stuck_joins(&mut registry, &bridge, &config).await;
            }
        }
    }
    info!("hub stopped");
}

async fn handle_command(
    registry: &mut Registry,
    command: HubCommand,
    bridge: &Arc<dyn SignalingBridge>,
    config: &GatewayConfig,
) {
    match command {
        HubCommand::Register { user, handle, reply } => {
            handle_register(registry, user, handle, reply, bridge).await;
        }
        HubCommand::Deregister { handle } => {
            handle_deregister(registry, handle, bridge).await;
        }
        HubCommand::Broadcast { event, except } => {
            broadcast(registry, event, except);
        }
        HubCommand::VoiceJoin {
            handle,
            muted,
            deafened,
            reply,
        } => {
            let result = handle_voice_join(registry, handle, muted, deafened, bridge, config).await;
            let _ = reply.send(result);
        }
        HubCommand::VoiceLeave { handle, reply } => {
            let result = handle_voice_leave(registry, handle, bridge).await;
            let _ = reply.send(result);
        }
        HubCommand::VoiceSetFlags {
            handle,
            muted,
            deafened,
            reply,
        } => {
            let _ = reply.send(handle_voice_set_flags(registry, handle, muted, deafened));
        }
        HubCommand::VoiceSpeaking {
            handle,
            speaking,
            reply,
        } => {
            let _ = reply.send(handle_voice_speaking(registry, handle, speaking));
        }
        HubCommand::Rtc {
            handle,
            payload,
            reply,
        } => {
            let result = handle_rtc(registry, handle, payload, bridge).await;
            let _ = reply.send(result);
        }
        HubCommand::ScreenShare {
            handle,
            action,
            reply,
        } => {
            let result = handle_screen_share(registry, handle, action, bridge).await;
            let _ = reply.send(result);
        }
        HubCommand::Shutdown => unreachable!("handled in the select loop"),
    }
}

/// Resolve the caller's user id, rejecting requests from a connection that
/// has been replaced by a newer one for the same user.
fn current_user(registry: &Registry, handle: &Arc<ConnectionHandle>) -> Result<i64, HubError> {
    let (user_id, _) = handle.identity().ok_or(HubError::Stale)?;
    match registry.by_user.get(&user_id) {
        Some(registered) if Arc::ptr_eq(&registered.handle, handle) => Ok(user_id),
        _ => Err(HubError::Stale),
    }
}

fn snapshot(registry: &Registry) -> Vec<Member> {
    let mut members: Vec<Member> = registry
        .by_user
        .values()
        .map(|registered| Member {
            user: registered.user.clone(),
            status: registered.handle.presence(),
            voice: registry.voice.get(&registered.user.id).map(|session| VoiceStateUpdate {
                user_id: registered.user.id,
                in_voice: true,
                muted: session.muted,
                deafened: session.deafened,
            }),
        })
        .collect();
    members.sort_by_key(|member| member.user.id);
    members
}

fn broadcast(registry: &Registry, event: ServerEvent, except: Option<i64>) {
    for registered in registry.by_user.values() {
        if Some(registered.user.id) == except {
            continue;
        }
        registered.handle.push(OutboundFrame::Event(event.clone()));
    }
}

fn push_to(registry: &Registry, user_id: i64, event: ServerEvent) {
    if let Some(registered) = registry.by_user.get(&user_id) {
        registered.handle.push(OutboundFrame::Event(event));
    }
}

async fn handle_register(
    registry: &mut Registry,
    user: User,
    handle: Arc<ConnectionHandle>,
    reply: oneshot::Sender<Vec<Member>>,
    bridge: &Arc<dyn SignalingBridge>,
) {
    let evicted = match registry.by_user.remove(&user.id) {
        Some(old) => {
            info!(user_id = user.id, "evicting superseded connection");
            teardown_voice(registry, user.id, bridge).await;
            old.handle.push(OutboundFrame::InvalidSession { resumable: false });
            old.handle.begin_close();
            true
        }
        None => false,
    };

    registry.by_user.insert(
        user.id,
        Registered {
            user: user.clone(),
            handle: handle.clone(),
        },
    );
    let members = snapshot(registry);
    let _ = reply.send(members);

    // A replaced session is still the same person as far as the roster is
    // concerned, so only a genuinely new arrival is announced.
    if !evicted {
        broadcast(
            registry,
            ServerEvent::UserJoined(Member {
                user: user.clone(),
                status: handle.presence(),
                voice: None,
            }),
            Some(user.id),
        );
    }
    debug!(user_id = user.id, online = registry.by_user.len(), "connection registered");
}

async fn handle_deregister(
    registry: &mut Registry,
    handle: Arc<ConnectionHandle>,
    bridge: &Arc<dyn SignalingBridge>,
) {
    let Some((user_id, _)) = handle.identity() else {
        return;
    };
    let current = registry
        .by_user
        .get(&user_id)
        .is_some_and(|registered| Arc::ptr_eq(&registered.handle, &handle));
    if !current {
        // An evicted connection deregistering after its replacement took over.
        return;
    }
    registry.by_user.remove(&user_id);
    teardown_voice(registry, user_id, bridge).await;
    broadcast(
        registry,
        ServerEvent::PresenceUpdate(PresenceUpdate {
            user_id,
            status: PresenceStatus::Offline,
        }),
        None,
    );
    broadcast(registry, ServerEvent::UserLeft(UserLeft { user_id }), None);
    debug!(user_id, online = registry.by_user.len(), "connection deregistered");
}

async fn handle_voice_join(
    registry: &mut Registry,
    handle: Arc<ConnectionHandle>,
    muted: bool,
    deafened: bool,
    bridge: &Arc<dyn SignalingBridge>,
    config: &GatewayConfig,
) -> Result<(), HubError> {
    let user_id = current_user(registry, &handle)?;
    if registry.voice.contains_key(&user_id) {
        return Err(HubError::AlreadyInVoice);
    }
    if let Err(err) = bridge.add_peer(user_id).await {
        log_bridge_error(user_id, "add_peer", &err);
        return Err(HubError::JoinFailed);
    }
    let mut session = VoiceSession::new(muted, deafened);
    session
        .join()
        .map_err(|_| HubError::JoinFailed)?;
    registry.voice.insert(user_id, session);

    let participants: Vec<VoiceParticipant> = registry
        .voice
        .iter()
        .filter(|(id, _)| **id != user_id)
        .map(|(id, session)| VoiceParticipant {
            user_id: *id,
            muted: session.muted,
            deafened: session.deafened,
        })
        .collect();
    // The joiner must know the negotiation parameters before anyone can
    // start signaling at them.
    handle.push(OutboundFrame::Event(ServerEvent::RtcReady(RtcReady {
        participants,
        ice_servers: config.ice_servers.clone(),
    })));
    broadcast(
        registry,
        ServerEvent::VoiceStateUpdate(VoiceStateUpdate {
            user_id,
            in_voice: true,
            muted,
            deafened,
        }),
        None,
    );
    info!(user_id, "voice join accepted");
    Ok(())
}

async fn handle_voice_leave(
    registry: &mut Registry,
    handle: Arc<ConnectionHandle>,
    bridge: &Arc<dyn SignalingBridge>,
) -> Result<(), HubError> {
    let user_id = current_user(registry, &handle)?;
    if !teardown_voice(registry, user_id, bridge).await {
        return Err(HubError::NotInVoice);
    }
    Ok(())
}

fn handle_voice_set_flags(
    registry: &mut Registry,
    handle: Arc<ConnectionHandle>,
    muted: Option<bool>,
    deafened: Option<bool>,
) -> Result<(), HubError> {
    let user_id = current_user(registry, &handle)?;
    let session = registry.voice.get_mut(&user_id).ok_or(HubError::NotInVoice)?;
    session
        .set_flags(muted, deafened)
        .map_err(|_| HubError::NotInVoice)?;
    let update = VoiceStateUpdate {
        user_id,
        in_voice: true,
        muted: session.muted,
        deafened: session.deafened,
    };
    broadcast(registry, ServerEvent::VoiceStateUpdate(update), None);
    Ok(())
}

fn handle_voice_speaking(
    registry: &mut Registry,
    handle: Arc<ConnectionHandle>,
    speaking: bool,
) -> Result<(), HubError> {
    let user_id = current_user(registry, &handle)?;
    if !registry.voice.contains_key(&user_id) {
        return Err(HubError::NotInVoice);
    }
    broadcast(
        registry,
        ServerEvent::VoiceSpeaking(VoiceSpeaking { user_id, speaking }),
        Some(user_id),
    );
    Ok(())
}

async fn handle_rtc(
    registry: &mut Registry,
    handle: Arc<ConnectionHandle>,
    payload: RtcPayload,
    bridge: &Arc<dyn SignalingBridge>,
) -> Result<(), HubError> {
    let user_id = current_user(registry, &handle)?;
    if !registry.voice.contains_key(&user_id) {
        return Err(HubError::NotInVoice);
    }
    let result = match payload {
        RtcPayload::Offer(sdp) => bridge.handle_offer(user_id, sdp).await,
        RtcPayload::Answer(sdp) => bridge.handle_answer(user_id, sdp).await,
        RtcPayload::Candidate(candidate) => bridge.handle_ice_candidate(user_id, candidate).await,
    };
    if let Err(err) = result {
        log_bridge_error(user_id, "signal", &err);
        if matches!(err, SignalingError::Fatal(_)) {
            teardown_voice(registry, user_id, bridge).await;
            push_to(
                registry,
                user_id,
                ServerEvent::Error(ErrorPayload::new(
                    ErrorCode::VoiceNegotiationFailed,
                    "media negotiation failed",
                )),
            );
        }
    }
    Ok(())
}

async fn handle_screen_share(
    registry: &mut Registry,
    handle: Arc<ConnectionHandle>,
    action: ScreenShareAction,
    bridge: &Arc<dyn SignalingBridge>,
) -> Result<(), HubError> {
    let user_id = current_user(registry, &handle)?;
    if !registry.voice.contains_key(&user_id) {
        return Err(HubError::NotInVoice);
    }
    match action {
        ScreenShareAction::Start => {
            if let Some(change) = registry.screen.start_share(user_id) {
                broadcast(
                    registry,
                    ServerEvent::ScreenShareUpdate(ScreenShareEvent {
                        user_id: change.user_id,
                        streaming: change.streaming,
                    }),
                    None,
                );
                renegotiate(user_id, bridge).await;
            }
        }
        ScreenShareAction::Stop => {
            if let Some(change) = registry.screen.stop_share(user_id) {
                broadcast(
                    registry,
                    ServerEvent::ScreenShareUpdate(ScreenShareEvent {
                        user_id: change.user_id,
                        streaming: change.streaming,
                    }),
                    None,
                );
                renegotiate(user_id, bridge).await;
            }
        }
        ScreenShareAction::Subscribe(streamer_id) => {
            // Subscribing to someone who is not streaming is a benign race
            // (the stream just ended); nothing to report.
            if registry.screen.subscribe(user_id, streamer_id).is_ok() {
                renegotiate(user_id, bridge).await;
            }
        }
        ScreenShareAction::Unsubscribe => {
            if registry.screen.unsubscribe(user_id) {
                renegotiate(user_id, bridge).await;
            }
        }
    }
    Ok(())
}

async fn renegotiate(user_id: i64, bridge: &Arc<dyn SignalingBridge>) {
    if let Err(err) = bridge.trigger_renegotiation(user_id).await {
        log_bridge_error(user_id, "renegotiate", &err);
    }
}

/// Remove a user's voice session, in that order: registry first so the
/// teardown can never run twice, then the relay, then the announcements.
async fn teardown_voice(
    registry: &mut Registry,
    user_id: i64,
    bridge: &Arc<dyn SignalingBridge>,
) -> bool {
    let Some(mut session) = registry.voice.remove(&user_id) else {
        return false;
    };
    if session.state() != VoiceState::Leaving {
        let _ = session.begin_leave();
    }
    if let Err(err) = bridge.remove_peer(user_id).await {
        log_bridge_error(user_id, "remove_peer", &err);
    }
    if let Some(change) = registry.screen.on_user_disconnect(user_id) {
        broadcast(
            registry,
            ServerEvent::ScreenShareUpdate(ScreenShareEvent {
                user_id: change.user_id,
                streaming: change.streaming,
            }),
            None,
        );
    }
    let _ = session.finish_leave();
    broadcast(
        registry,
        ServerEvent::VoiceStateUpdate(VoiceStateUpdate {
            user_id,
            in_voice: false,
            muted: false,
            deafened: false,
        }),
        None,
    );
    info!(user_id, "voice session torn down");
    true
}

async fn handle_signaling(
    registry: &mut Registry,
    event: SignalingEvent,
    bridge: &Arc<dyn SignalingBridge>,
) {
    match event {
        SignalingEvent::Offer { user_id, sdp } => {
            push_to(
                registry,
                user_id,
                ServerEvent::RtcOffer(RtcSignal {
                    user_id,
                    sdp: Some(sdp.sdp),
                    candidate: None,
                }),
            );
        }
        SignalingEvent::Answer { user_id, sdp } => {
            push_to(
                registry,
                user_id,
                ServerEvent::RtcAnswer(RtcSignal {
                    user_id,
                    sdp: Some(sdp.sdp),
                    candidate: None,
                }),
            );
        }
        SignalingEvent::IceCandidate { user_id, candidate } => {
            push_to(
                registry,
                user_id,
                ServerEvent::RtcIceCandidate(RtcSignal {
                    user_id,
                    sdp: None,
                    candidate: Some(candidate),
                }),
            );
        }
        SignalingEvent::PeerConnected { user_id } => {
            let Some(session) = registry.voice.get_mut(&user_id) else {
                debug!(user_id, "peer connected for unknown voice session");
                return;
            };
            if session.state() == VoiceState::Active {
                return;
            }
            match session.activate() {
                Ok(()) => {
                    let update = VoiceStateUpdate {
                        user_id,
                        in_voice: true,
                        muted: session.muted,
                        deafened: session.deafened,
                    };
                    broadcast(registry, ServerEvent::VoiceStateUpdate(update), None);
                    info!(user_id, "voice session active");
                }
                Err(err) => {
                    warn!(user_id, error = %err, "peer connected in unexpected state");
                }
            }
        }
        SignalingEvent::RenegotiationComplete { user_id } => {
            if let Some(streamer) = registry.screen.on_renegotiation_complete(user_id) {
                if let Err(err) = bridge.request_keyframe(streamer).await {
                    log_bridge_error(streamer, "request_keyframe", &err);
                }
            }
        }
        SignalingEvent::PeerError { user_id, error } => match error {
            SignalingError::Fatal(reason) => {
                error!(user_id, %reason, "fatal peer error, tearing down voice");
                teardown_voice(registry, user_id, bridge).await;
                push_to(
                    registry,
                    user_id,
                    ServerEvent::Error(ErrorPayload::new(
                        ErrorCode::VoiceNegotiationFailed,
                        "media negotiation failed",
                    )),
                );
            }
            SignalingError::Transient(reason) => {
                warn!(user_id, %reason, "transient peer error");
            }
            SignalingError::Closed => {
                // Normal teardown race, nothing to clean up here.
                debug!(user_id, "relay reported closed connection");
            }
        },
    }
}

/// Expire voice sessions that never made it out of Joining. The relay side
/// may be gone or wedged; the user gets an error and a clean slate.
async fn sweep_stuck_joins(
    registry: &mut Registry,
    bridge: &Arc<dyn SignalingBridge>,
    config: &GatewayConfig,
) {
    let now = Instant::now();
    let stuck: Vec<i64> = registry
        .voice
        .iter()
        .filter(|(_, session)| {
            session.state() == VoiceState::Joining
                && now.saturating_duration_since(session.joined_at()) >= config.joining_timeout
        })
        .map(|(id, _)| *id)
        .collect();
    for user_id in stuck {
        warn!(user_id, "voice join timed out");
        teardown_voice(registry, user_id, bridge).await;
        push_to(
            registry,
            user_id,
            ServerEvent::Error(ErrorPayload::new(
                ErrorCode::VoiceNegotiationTimeout,
                "voice negotiation timed out",
            )),
        );
    }
}

async fn close_all(registry: &mut Registry, bridge: &Arc<dyn SignalingBridge>) {
    info!(connections = registry.by_user.len(), "closing all connections");
    let user_ids: Vec<i64> = registry.voice.keys().copied().collect();
    for user_id in user_ids {
        teardown_voice(registry, user_id, bridge).await;
    }
    for registered in registry.by_user.values() {
        registered.handle.push(OutboundFrame::Reconnect);
        registered.handle.begin_close();
    }
    registry.by_user.clear();
}

fn log_bridge_error(user_id: i64, op: &str, err: &SignalingError) {
    match err {
        // A closed relay during teardown is the normal race, not a fault.
        SignalingError::Closed => debug!(user_id, op, "relay connection closed"),
        SignalingError::Transient(reason) => warn!(user_id, op, %reason, "transient relay error"),
        SignalingError::Fatal(reason) => error!(user_id, op, %reason, "fatal relay error"),
    }
}
