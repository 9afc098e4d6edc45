//! WebSocket transport: handshake authentication, per-connection writer
//! task, and the read loop feeding the relay.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::identity::IdentityVerifier;
use crate::registry::generate_connection_id;
use crate::relay::RelayState;
use crate::signaling::{ClientMessage, ServerMessage};

const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct WsState {
    pub relay: Arc<RelayState>,
    pub verifier: IdentityVerifier,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: String,
}

/// Upgrade handler. Authentication happens before the upgrade so an invalid
/// token is refused with a plain 401 instead of an opened-then-closed socket.
pub async fn ws_handler(
    State(state): State<Arc<WsState>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match state.verifier.verify(&params.token) {
        Ok(identity) => identity,
        Err(err) => {
            debug!(error = %err, "websocket handshake rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>, identity: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = generate_connection_id();

    debug!(connection_id, identity, "websocket connected");
    state
        .relay
        .register_connection(connection_id.clone(), identity, tx.clone())
        .await;

    // Single writer task owns the sink; everything else goes through `tx`.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to encode outbound message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    state.relay.handle_message(&connection_id, message).await;
                }
                Err(err) => {
                    debug!(connection_id, error = %err, "unrecognized message");
                    let _ = tx.send(ServerMessage::Error {
                        call_id: None,
                        reason: "unrecognized message".to_string(),
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            // Protocol pings are answered by axum; binary frames are not
            // part of this protocol.
            Ok(_) => {}
            Err(err) => {
                debug!(connection_id, error = %err, "websocket read error");
                break;
            }
        }
    }

    state.relay.disconnect(&connection_id).await;
    writer.abort();
    debug!(connection_id, "websocket closed");
}

/// Periodically disconnect connections whose application-level heartbeat
/// went quiet. Protocol-level liveness alone is not trusted here because
/// some proxies keep dead tunnels pinging.
pub fn spawn_heartbeat_monitor(relay: Arc<RelayState>, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            for connection_id in relay.registry().stale_connections(timeout) {
                warn!(connection_id, "heartbeat timeout; disconnecting");
                relay.disconnect(&connection_id).await;
            }
        }
    })
}
