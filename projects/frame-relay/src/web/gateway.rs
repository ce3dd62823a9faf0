// Broadcast gateway: WebSocket clients submit frames and receive every detection

use crate::error::{RelayError, Result};
use crate::relay::service::DispatchHandle;
use crate::relay::types::{Detection, RequestId};
use crate::web::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Events a client may send.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Frame(Vec<String>),
}

/// Events sent to clients.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Worker output, sent to every client.
    Detection {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
    /// Acknowledgement to the submitter only.
    Queued {
        request_id: RequestId,
        queue_depth: usize,
    },
    /// Rejected submission, to the submitter only.
    Error { message: String },
}

impl From<Detection> for ServerMessage {
    fn from(detection: Detection) -> Self {
        ServerMessage::Detection {
            data: detection.text,
            request_id: detection.request_id,
        }
    }
}

/// Tokens travel comma-joined on one line, so they may not carry either.
///
/// A frame whose line would be blank is refused too; the worker never answers one.
pub fn validate_tokens(tokens: &[String]) -> Result<()> {
    for (index, token) in tokens.iter().enumerate() {
        if token.contains([',', '\n', '\r']) {
            return Err(RelayError::BadFrame(format!(
                "token {} contains a comma or line break",
                index
            )));
        }
    }
    if tokens.len() < 2 && tokens.iter().all(|token| token.trim().is_empty()) {
        return Err(RelayError::BadFrame("frame is empty".to_string()));
    }
    Ok(())
}

/// Parse and validate one inbound text message.
pub fn parse_frame(text: &str) -> Result<Vec<String>> {
    let ClientMessage::Frame(tokens) =
        serde_json::from_str(text).map_err(|e| RelayError::BadFrame(e.to_string()))?;
    validate_tokens(&tokens)?;
    Ok(tokens)
}

/// Turn one inbound message into the reply for its sender.
pub async fn handle_client_text(
    text: &str,
    dispatch: &DispatchHandle,
    client_id: u64,
) -> ServerMessage {
    let tokens = match parse_frame(text) {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(client_id, "Rejected malformed frame: {}", e);
            return ServerMessage::Error {
                message: e.to_string(),
            };
        }
    };

    match dispatch.submit(tokens).await {
        Ok(receipt) => {
            debug!(
                client_id,
                request_id = receipt.request_id,
                queue_depth = receipt.queue_depth,
                "Received frame"
            );
            ServerMessage::Queued {
                request_id: receipt.request_id,
                queue_depth: receipt.queue_depth,
            }
        }
        Err(e) => {
            warn!(client_id, "Frame not queued: {}", e);
            ServerMessage::Error {
                message: e.to_string(),
            }
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    // Subscribing here makes the client eligible for broadcasts immediately.
    let mut detections = state.detections.subscribe();
    info!(
        client_id,
        connected = state.detections.receiver_count(),
        "Client connected"
    );

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                detection = detections.recv() => match detection {
                    Ok(detection) => ServerMessage::from(detection),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id, skipped, "Client fell behind; detections skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };

            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(client_id, "Failed to encode message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let dispatch = state.dispatch.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    let reply = handle_client_text(&text, &dispatch, client_id).await;
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                Message::Binary(_) => {
                    debug!(client_id, "Ignoring binary message");
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(client_id, "Client disconnected");
}
