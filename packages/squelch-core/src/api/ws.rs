//! WebSocket handler for the signalling and audio path.
//!
//! One connection carries both planes: text frames are JSON signalling
//! messages, binary frames are raw 640-byte PCM. The socket is split; a
//! writer task drains the session's outbound queue so the relay core never
//! awaits a transport write, and the read loop feeds parsed messages and
//! frames into the relay.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::constants::OUTBOUND_QUEUE_CAPACITY;
use crate::error::RelayError;
use crate::protocol::{parse_client_message, Inbound};
use crate::relay::{ClientHandle, Outbound};

/// Grace period for the writer task to flush pending messages (e.g. the
/// `kicked` notice) after the read loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main WebSocket connection handler.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Register connection for tracking and force-close capability.
    let conn = state.connections.register();
    let session_id = conn.id();
    let cancel = conn.cancel_token().clone();

    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_CAPACITY);
    state
        .relay
        .connect(session_id, ClientHandle::new(tx, cancel.clone()));

    // Writer task: the only place this session's transport is written, so
    // outbound order is exactly the enqueue order.
    let mut writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let msg = match item {
                Outbound::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        log::warn!("[WS] Failed to serialize outbound message: {}", e);
                        continue;
                    }
                },
                Outbound::Frame(frame) => Message::Binary(frame),
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });
    let mut writer_done = false;

    loop {
        tokio::select! {
            // Kick, eviction, or shutdown.
            _ = cancel.cancelled() => {
                log::info!("[WS] Connection force-closed: {}", session_id);
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_client_message(&text) {
                        Inbound::Message(msg) => state.relay.handle_message(session_id, msg),
                        Inbound::UnknownType(kind) => {
                            let err = RelayError::UnknownType(kind);
                            state.relay.send_error(session_id, err.to_string());
                        }
                        // Malformed JSON is dropped without a reply.
                        Inbound::Invalid => {
                            log::debug!("[WS] Dropping malformed message from {}", session_id);
                        }
                    },
                    Some(Ok(Message::Binary(data))) => {
                        state.relay.ingest_frame(session_id, data);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Transport-level ping/pong is answered by axum.
                    _ => {}
                }
            }
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break;
            }
        }
    }

    // Removing the session drops the last outbound senders; the writer then
    // drains what is already queued and exits on its own.
    state.relay.disconnect(session_id);
    if !writer_done {
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await;
    }
    writer.abort();
}
