use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lanyard_gateway::signaling::{SignalingBridge, SignalingError, SignalingEvent};
use lanyard_models::voice::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Command sent to the relay, one JSON object per line.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlCommand<'a> {
    AddPeer { user_id: i64 },
    RemovePeer { user_id: i64 },
    Offer { user_id: i64, sdp: &'a str },
    Answer { user_id: i64, sdp: &'a str },
    IceCandidate {
        user_id: i64,
        candidate: &'a IceCandidate,
    },
    Renegotiate { user_id: i64 },
    RequestKeyframe { user_id: i64 },
}

/// Event received from the relay, one JSON object per line.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlEvent {
    Offer { user_id: i64, sdp: String },
    Answer { user_id: i64, sdp: String },
    IceCandidate {
        user_id: i64,
        candidate: IceCandidate,
    },
    PeerConnected { user_id: i64 },
    RenegotiationComplete { user_id: i64 },
    PeerError {
        user_id: i64,
        #[serde(default)]
        fatal: bool,
        message: String,
    },
}

impl From<ControlEvent> for SignalingEvent {
    fn from(event: ControlEvent) -> Self {
        match event {
            ControlEvent::Offer { user_id, sdp } => SignalingEvent::Offer {
                user_id,
                sdp: SessionDescription { sdp },
            },
            ControlEvent::Answer { user_id, sdp } => SignalingEvent::Answer {
                user_id,
                sdp: SessionDescription { sdp },
            },
            ControlEvent::IceCandidate { user_id, candidate } => {
                SignalingEvent::IceCandidate { user_id, candidate }
            }
            ControlEvent::PeerConnected { user_id } => SignalingEvent::PeerConnected { user_id },
            ControlEvent::RenegotiationComplete { user_id } => {
                SignalingEvent::RenegotiationComplete { user_id }
            }
            ControlEvent::PeerError {
                user_id,
                fatal,
                message,
            } => SignalingEvent::PeerError {
                user_id,
                error: if fatal {
                    SignalingError::Fatal(message)
                } else {
                    SignalingError::Transient(message)
                },
            },
        }
    }
}

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Bridge to a media relay over its line-delimited JSON control socket.
/// A dropped connection is re-dialed in the background; commands sent in
/// the meantime fail with `Closed` and the hub treats them as teardown races.
pub struct RelayBridge {
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl RelayBridge {
    /// Connect and start pumping relay events into the hub's channel.
    pub async fn connect(addr: &str, events: mpsc::Sender<SignalingEvent>) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to media relay at {addr}"))?;
        let (read_half, write_half) = stream.into_split();
        info!(%addr, "connected to media relay");

        let bridge = Arc::new(Self {
            writer: Mutex::new(Some(write_half)),
        });
        tokio::spawn(supervise(
            bridge.clone(),
            addr.to_string(),
            events,
            read_half,
        ));
        Ok(bridge)
    }

    async fn send(&self, command: ControlCommand<'_>) -> Result<(), SignalingError> {
        let mut line = serde_json::to_vec(&command)
            .map_err(|err| SignalingError::Transient(err.to_string()))?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        let Some(half) = writer.as_mut() else {
            return Err(SignalingError::Closed);
        };
        match half.write_all(&line).await {
            Ok(()) => Ok(()),
            Err(err) => {
                *writer = None;
                Err(classify_io(err))
            }
        }
    }
}

/// Read relay events until the connection drops, then re-dial forever.
async fn supervise(
    bridge: Arc<RelayBridge>,
    addr: String,
    events: mpsc::Sender<SignalingEvent>,
    first_reader: tokio::net::tcp::OwnedReadHalf,
) {
    let mut reader = Some(first_reader);
    loop {
        if let Some(read_half) = reader.take() {
            pump_events(read_half, &events).await;
            *bridge.writer.lock().await = None;
            warn!(%addr, "relay control socket lost");
        }
        if events.is_closed() {
            debug!("hub gone, stopping relay supervisor");
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                *bridge.writer.lock().await = Some(write_half);
                info!(%addr, "reconnected to media relay");
                reader = Some(read_half);
            }
            Err(err) => {
                warn!(%addr, error = %err, "relay reconnect failed, retrying");
            }
        }
    }
}

async fn pump_events(
    read_half: tokio::net::tcp::OwnedReadHalf,
    events: &mpsc::Sender<SignalingEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ControlEvent>(line) {
                    Ok(event) => {
                        if events.send(event.into()).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "unparseable relay event");
                    }
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "relay control socket read failed");
                return;
            }
        }
    }
}

fn classify_io(err: io::Error) -> SignalingError {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => SignalingError::Closed,
        _ => SignalingError::Transient(err.to_string()),
    }
}

#[async_trait]
impl SignalingBridge for RelayBridge {
    async fn add_peer(&self, user_id: i64) -> Result<(), SignalingError> {
        self.send(ControlCommand::AddPeer { user_id }).await
    }

    async fn remove_peer(&self, user_id: i64) -> Result<(), SignalingError> {
        self.send(ControlCommand::RemovePeer { user_id }).await
    }

    async fn handle_offer(
        &self,
        user_id: i64,
        sdp: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.send(ControlCommand::Offer {
            user_id,
            sdp: &sdp.sdp,
        })
        .await
    }

    async fn handle_answer(
        &self,
        user_id: i64,
        sdp: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.send(ControlCommand::Answer {
            user_id,
            sdp: &sdp.sdp,
        })
        .await
    }

    async fn handle_ice_candidate(
        &self,
        user_id: i64,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.send(ControlCommand::IceCandidate {
            user_id,
            candidate: &candidate,
        })
        .await
    }

    async fn trigger_renegotiation(&self, user_id: i64) -> Result<(), SignalingError> {
        self.send(ControlCommand::Renegotiate { user_id }).await
    }

    async fn request_keyframe(&self, user_id: i64) -> Result<(), SignalingError> {
        self.send(ControlCommand::RequestKeyframe { user_id }).await
    }
}

/// Stand-in bridge for deployments without a media relay. Voice joins fail
/// cleanly; everything else is a no-op.
pub struct NullBridge;

#[async_trait]
impl SignalingBridge for NullBridge {
    async fn add_peer(&self, _user_id: i64) -> Result<(), SignalingError> {
        Err(SignalingError::Transient("no media relay configured".into()))
    }

    async fn remove_peer(&self, _user_id: i64) -> Result<(), SignalingError> {
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

    async fn trigger_renegotiation(&self, _user_id: i64) -> Result<(), SignalingError> {
        Ok(())
    }

    async fn request_keyframe(&self, _user_id: i64) -> Result<(), SignalingError> {
        Ok(())
    }
}
