use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use parley_proto::{parse_frame, Frame, WireError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::registry::{Registry, RelayError};

/// Explicit per-connection session record: set by an accepted join, cleared
/// by leave/close, never inferred from fields of later messages.
struct ConnectionSession {
    room_code: String,
    user_id: String,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<Registry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<Registry>) {
    let (mut sender, mut receiver) = socket.split();

    // Writer task: everything the registry (or this handler) wants to send
    // goes through one unbounded channel, so sends never block room state.
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!("failed to serialize outbound frame: {err}"),
            }
        }
    });

    let mut session: Option<ConnectionSession> = None;

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(err) => {
                debug!("websocket error: {err}");
                break;
            }
        };
        match msg {
            Message::Text(text) => match parse_frame(&text) {
                Ok(frame) => dispatch_frame(frame, &registry, &tx, &mut session),
                Err(err) => {
                    warn!("rejecting unparseable frame: {err}");
                    let _ = tx.send(Frame::Error {
                        message: parse_error_message(err),
                    });
                }
            },
            Message::Close(_) => break,
            // Ping/pong is handled by axum; binary frames are not part of
            // the protocol.
            _ => {}
        }
    }

    // Transport close or error counts as leaving, unless a reconnection
    // already replaced this connection's transport.
    if let Some(session) = session.take() {
        registry.leave_connection(&session.room_code, &session.user_id, &tx);
    }
}

/// Map a parse failure to the error echoed back to the offender. A `join`
/// whose fields do not deserialize is an invalid join request, same as one
/// with empty fields; unknown or missing type tags are unknown-type errors.
fn parse_error_message(err: WireError) -> String {
    match err {
        WireError::UnknownType(tag) => RelayError::UnknownMessageType(tag).to_string(),
        WireError::MissingType => RelayError::UnknownMessageType("<missing>".to_string()).to_string(),
        WireError::InvalidFields { kind: "join", .. } => {
            RelayError::InvalidJoinRequest("join frame is missing required fields").to_string()
        }
        other => other.to_string(),
    }
}

fn dispatch_frame(
    frame: Frame,
    registry: &Registry,
    tx: &mpsc::UnboundedSender<Frame>,
    session: &mut Option<ConnectionSession>,
) {
    match frame {
        Frame::Join { room_id, user } => match registry.join(&room_id, &user, tx.clone()) {
            Ok(summary) => {
                *session = Some(ConnectionSession {
                    room_code: summary.room_code,
                    user_id: user.id,
                });
            }
            Err(err) => {
                // Reported to the offending connection only.
                let _ = tx.send(Frame::Error {
                    message: err.to_string(),
                });
            }
        },
        Frame::Offer { .. }
        | Frame::Answer { .. }
        | Frame::IceCandidate { .. }
        | Frame::ChatMessage { .. } => {
            // A negotiation frame before any join has no sender identity;
            // like a frame racing a departure, it is dropped silently.
            if let Some(session) = session.as_ref() {
                registry.relay(&session.room_code, &session.user_id, frame);
            } else {
                debug!(kind = frame.kind(), "negotiation frame before join dropped");
            }
        }
        Frame::Leave { .. } => {
            if let Some(session) = session.take() {
                registry.leave(&session.room_code, &session.user_id);
            }
        }
        // Server-to-client frames arriving inbound are a protocol violation.
        other => {
            let err = RelayError::UnknownMessageType(other.kind().to_string());
            warn!("{err}");
            let _ = tx.send(Frame::Error {
                message: err.to_string(),
            });
        }
    }
}
