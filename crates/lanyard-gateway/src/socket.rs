use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lanyard_models::gateway::{
    ClientCommand, ErrorCode, ErrorPayload, GatewayMessage, ServerEvent, OP_DISPATCH, OP_HELLO,
    OP_INVALID_SESSION, OP_READY, OP_RECONNECT,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionHandle, OutboundFrame};
use crate::GatewayContext;

/// `GET /gateway` upgrade handler.
pub async fn gateway_upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<GatewayContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Drive one client connection to completion. The socket is split into a
/// writer task and this read loop; both watch the close signal so either
/// side of the protocol can end the session.
pub async fn handle_socket(socket: WebSocket, ctx: GatewayContext) {
    let (mut conn, outbound_rx) = Connection::new(&ctx);
    let handle = conn.handle.clone();
    conn.send_hello();

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        handle.clone(),
        ctx.config.keepalive_interval,
    ));

    read_loop(stream, &mut conn).await;

    handle.begin_close();
    if handle.identity().is_some() {
        ctx.hub.deregister(handle.clone()).await;
    }
    if let Err(err) = writer.await {
        debug!(error = %err, "writer task aborted");
    }
    handle.finish_close();
    debug!("connection closed");
}

/// Block until the close signal fires. The watch guard stays inside so the
/// returned future holds nothing non-Send across awaits in select arms.
async fn wait_closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}

async fn read_loop(mut stream: SplitStream<WebSocket>, conn: &mut Connection) {
    let handle = conn.handle.clone();
    let mut closing = handle.closing_watch();
    loop {
        tokio::select! {
            _ = wait_closed(&mut closing) => break,
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_text(&text, conn).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames and ping/pong replies
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket read error");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_text(text: &str, conn: &mut Connection) {
    let envelope: GatewayMessage = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            conn.handle.push(OutboundFrame::Event(ServerEvent::Error(
                ErrorPayload::new(ErrorCode::DecodeError, format!("malformed frame: {err}")),
            )));
            return;
        }
    };
    match ClientCommand::from_envelope(&envelope) {
        Ok(command) => conn.handle_command(command).await,
        Err(err) => {
            conn.handle.push(OutboundFrame::Event(ServerEvent::Error(
                ErrorPayload::new(ErrorCode::DecodeError, err.to_string()),
            )));
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    handle: Arc<ConnectionHandle>,
    keepalive: std::time::Duration,
) {
    let mut closing = handle.closing_watch();
    let mut keepalive = tokio::time::interval(keepalive);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = wait_closed(&mut closing) => {
                // Flush whatever is already queued, then say goodbye.
                while let Ok(frame) = outbound.try_recv() {
                    if send_frame(&mut sink, frame, &mut sequence).await.is_err() {
                        return;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return };
                if send_frame(&mut sink, frame, &mut sequence).await.is_err() {
                    handle.begin_close();
                    return;
                }
            }
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    handle.begin_close();
                    return;
                }
            }
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: OutboundFrame,
    sequence: &mut u64,
) -> Result<(), axum::Error> {
    match encode_frame(frame, sequence) {
        Ok(text) => sink.send(Message::Text(text.into())).await,
        Err(err) => {
            warn!(error = %err, "failed to encode outbound frame");
            Ok(())
        }
    }
}

/// Serialize a frame to the wire envelope. Only DISPATCH frames consume a
/// sequence number.
fn encode_frame(frame: OutboundFrame, sequence: &mut u64) -> Result<String, serde_json::Error> {
    let envelope = match frame {
        OutboundFrame::Hello => GatewayMessage {
            op: OP_HELLO,
            t: None,
            d: None,
            s: None,
        },
        OutboundFrame::Ready(ready) => GatewayMessage {
            op: OP_READY,
            t: None,
            d: Some(serde_json::to_value(&ready)?),
            s: None,
        },
        OutboundFrame::InvalidSession { resumable } => GatewayMessage {
            op: OP_INVALID_SESSION,
            t: None,
            d: Some(Value::Bool(resumable)),
            s: None,
        },
        OutboundFrame::Reconnect => GatewayMessage {
            op: OP_RECONNECT,
            t: None,
            d: None,
            s: None,
        },
        OutboundFrame::Event(event) => {
            *sequence += 1;
            let name = event.name();
            let tagged = serde_json::to_value(&event)?;
            let d = match tagged {
                Value::Object(mut map) => map.remove("d"),
                _ => None,
            };
            GatewayMessage {
                op: OP_DISPATCH,
                t: Some(name.to_string()),
                d,
                s: Some(*sequence),
            }
        }
    };
    serde_json::to_string(&envelope)
}
