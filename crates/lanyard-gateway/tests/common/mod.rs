use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lanyard_core::auth::create_token;
use lanyard_core::store::{MemoryMessageStore, MemoryUserStore};
use lanyard_gateway::connection::{Connection, OutboundFrame};
use lanyard_gateway::hub::{Hub, RtcPayload};
use lanyard_gateway::signaling::{SignalingBridge, SignalingError, SignalingEvent};
use lanyard_gateway::{GatewayConfig, GatewayContext};
use lanyard_models::gateway::{ClientCommand, Identify, ServerEvent};
use lanyard_models::user::User;
use lanyard_models::voice::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

pub const SECRET: &str = "test-secret";

/// Records relay calls so tests can assert on exactly what the hub asked
/// the media side to do.
#[derive(Default)]
pub struct StubBridge {
    pub added: Mutex<Vec<i64>>,
    pub removed: Mutex<Vec<i64>>,
    pub renegotiated: Mutex<Vec<i64>>,
    pub keyframes: Mutex<Vec<i64>>,
    pub fail_add: AtomicBool,
}

impl StubBridge {
    pub fn added(&self) -> Vec<i64> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<i64> {
        self.removed.lock().unwrap().clone()
    }

    pub fn renegotiated(&self) -> Vec<i64> {
        self.renegotiated.lock().unwrap().clone()
    }

    pub fn keyframes(&self) -> Vec<i64> {
        self.keyframes.lock().unwrap().clone()
    }

    pub fn fail_next_add(&self) {
        self.fail_add.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingBridge for StubBridge {
    async fn add_peer(&self, user_id: i64) -> Result<(), SignalingError> {
        if self.fail_add.swap(false, Ordering::SeqCst) {
            return Err(SignalingError::Transient("relay down".into()));
        }
        self.added.lock().unwrap().push(user_id);
        Ok(())
    }

    async fn remove_peer(&self, user_id: i64) -> Result<(), SignalingError> {
        self.removed.lock().unwrap().push(user_id);
        Ok(())
    }

    async fn handle_offer(&self, _: i64, _: SessionDescription) -> Result<(), SignalingError> {
        Ok(())
    }

    async fn handle_answer(&self, _: i64, _: SessionDescription) -> Result<(), SignalingError> {
        Ok(())
    }

    async fn handle_ice_candidate(&self, _: i64, _: IceCandidate) -> Result<(), SignalingError> {
        Ok(())
    }

    async fn trigger_renegotiation(&self, user_id: i64) -> Result<(), SignalingError> {
        self.renegotiated.lock().unwrap().push(user_id);
        Ok(())
    }

    async fn request_keyframe(&self, user_id: i64) -> Result<(), SignalingError> {
        self.keyframes.lock().unwrap().push(user_id);
        Ok(())
    }
}

pub struct TestGateway {
    pub ctx: GatewayContext,
    pub bridge: Arc<StubBridge>,
    pub signals: mpsc::Sender<SignalingEvent>,
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        jwt_secret: SECRET.to_string(),
        ..GatewayConfig::default()
    }
}

/// Spin up a hub with seeded users alice(1), bob(2) and carol(3).
pub fn gateway() -> TestGateway {
    gateway_with_config(test_config())
}

pub fn gateway_with_config(config: GatewayConfig) -> TestGateway {
    let bridge = Arc::new(StubBridge::default());
    let (signals, signal_rx) = mpsc::channel(64);
    let config = Arc::new(config);
    let hub = Hub::spawn(config.clone(), bridge.clone(), signal_rx);

    let users = MemoryUserStore::new();
    users.insert(User::new(1, "alice"));
    users.insert(User::new(2, "bob"));
    users.insert(User::new(3, "carol"));

    let ctx = GatewayContext {
        hub,
        users: Arc::new(users),
        messages: Arc::new(MemoryMessageStore::new(128)),
        config,
    };
    TestGateway { ctx, bridge, signals }
}

/// Connect and identify a seeded user, draining the setup frames (HELLO and
/// READY) so tests start from a clean queue.
pub async fn identified(
    gw: &TestGateway,
    user_id: i64,
) -> (Connection, mpsc::Receiver<OutboundFrame>) {
    let (mut conn, mut rx) = Connection::new(&gw.ctx);
    conn.send_hello();
    let token = create_token(user_id, SECRET, 60).unwrap();
    conn.handle_command(ClientCommand::Identify(Identify { token }))
        .await;
    assert!(matches!(rx.recv().await, Some(OutboundFrame::Hello)));
    match rx.recv().await {
        Some(OutboundFrame::Ready(_)) => {}
        other => panic!("expected READY, got {other:?}"),
    }
    (conn, rx)
}

/// Wait until every command queued before this call has been processed by
/// the hub loop. The probe command has no observable side effects.
pub async fn settle(gw: &TestGateway, conn: &Connection) {
    let _ = gw
        .ctx
        .hub
        .forward_rtc(
            conn.handle.clone(),
            RtcPayload::Candidate(IceCandidate {
                candidate: String::new(),
                sdp_mid: None,
                sdp_m_line_index: None,
            }),
        )
        .await;
}

/// Await the next dispatch frame, failing loudly on anything else.
pub async fn next_event(rx: &mut mpsc::Receiver<OutboundFrame>) -> ServerEvent {
    match tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await {
        Ok(Some(OutboundFrame::Event(event))) => event,
        other => panic!("expected event frame, got {other:?}"),
    }
}

pub fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

pub fn events(frames: &[OutboundFrame]) -> Vec<&ServerEvent> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            OutboundFrame::Event(event) => Some(event),
            _ => None,
        })
        .collect()
}

pub fn event_names(frames: &[OutboundFrame]) -> Vec<&'static str> {
    events(frames).into_iter().map(|event| event.name()).collect()
}
