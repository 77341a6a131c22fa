use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::Deserialize;
use std::sync::Arc;

use crate::coordinator::{Outbound, OutboxReceiver};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;

/// Close code for a missing or invalid credential
const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::info!(
        has_token = params.token.is_some(),
        "WebSocket connection request"
    );

    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Write one outbound frame. Returns false once the socket should stop.
async fn write_frame(sender: &mut WsSender, frame: Outbound) -> bool {
    match frame {
        Outbound::Message(msg) => match serde_json::to_string(&msg) {
            Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
            Err(e) => {
                tracing::error!("Failed to encode outbound message: {}", e);
                true
            }
        },
        Outbound::Close { code, reason } => {
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            false
        }
    }
}

/// Flush whatever the coordinator queued for a rejected connection
async fn drain(sender: &mut WsSender, outbox: &mut OutboxReceiver) {
    while let Some(frame) = outbox.recv().await {
        if !write_frame(sender, frame).await {
            break;
        }
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, params: WsQuery, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let (identity, privileged) = match state.authenticate(params.token.as_deref()).await {
        Ok(verified) => verified,
        Err(e) => {
            tracing::warn!("Refusing WebSocket: {}", e);
            let _ = write_frame(
                &mut sender,
                Outbound::Message(ServerMessage::error(e.to_string())),
            )
            .await;
            let _ = write_frame(
                &mut sender,
                Outbound::Close {
                    code: POLICY_VIOLATION,
                    reason: "unauthorized".to_string(),
                },
            )
            .await;
            return;
        }
    };
    let uid = identity.uid.clone();

    let (outbox, mut outbox_rx) = state.coordinator.outbox();
    let Some(conn) = state
        .coordinator
        .connect(identity, privileged, outbox)
        .await
    else {
        tracing::info!(uid = %uid, "WebSocket not admitted");
        drain(&mut sender, &mut outbox_rx).await;
        return;
    };

    tracing::info!(conn = %conn, uid = %uid, privileged, "WebSocket admitted");

    loop {
        tokio::select! {
            // Frames queued by the coordinator for this connection
            frame = outbox_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if !write_frame(&mut sender, frame).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Handle client messages
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::parse(text.as_str()) {
                            Ok(client_msg) => state.coordinator.inbound(conn, client_msg).await,
                            Err(e) => {
                                tracing::debug!(conn = %conn, "Ignoring malformed message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(conn = %conn, "WebSocket closed by client");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::info!(conn = %conn, "WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.coordinator.disconnect(conn).await;
    tracing::info!(conn = %conn, uid = %uid, "WebSocket connection closed");
}
