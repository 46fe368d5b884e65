use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers::AppState;
use crate::registry::PeerHandle;
use crate::relay::Relay;
use crate::signaling::{ClientMessage, ServerMessage, SignalKind};

/// WebSocket upgrade handler for the control socket
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-socket state held by the read loop
struct Connection {
    id: Uuid,
    peer_id: Option<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    close: Arc<Notify>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut conn = Connection {
        id: Uuid::new_v4(),
        peer_id: None,
        tx,
        close: Arc::new(Notify::new()),
    };

    let connection_id = conn.id;
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(%connection_id, error = %e, "failed to encode server message"),
            }
        }
        let _ = sender.close().await;
        debug!(%connection_id, "socket writer ended");
    });

    debug!(%connection_id, "control socket connected");
    let idle_timeout = state.idle_timeout;

    loop {
        let next = tokio::select! {
            _ = conn.close.notified() => {
                info!(%connection_id, peer = ?conn.peer_id, "socket displaced by newer registration");
                break;
            }
            next = tokio::time::timeout(idle_timeout, receiver.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                info!(%connection_id, peer = ?conn.peer_id, "control socket idle; closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(%connection_id, error = %e, "websocket error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let text = match msg {
            Message::Text(text) => text,
            // Some clients send JSON in binary frames
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(%connection_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => handle_client_message(client_msg, &mut conn, &state.relay).await,
            Err(e) => warn!(%connection_id, error = %e, "dropping malformed control message"),
        }
    }

    if let Some(peer_id) = conn.peer_id.take() {
        state.relay.disconnect(&peer_id, connection_id).await;
    }
    debug!(%connection_id, "control socket closed");
}

async fn handle_client_message(message: ClientMessage, conn: &mut Connection, relay: &Relay) {
    if let ClientMessage::Register { id } = message {
        let id = id.trim().to_string();
        if id.is_empty() {
            warn!(connection_id = %conn.id, "register without an id; ignored");
            return;
        }
        if let Some(previous) = conn.peer_id.take() {
            if previous != id {
                relay.disconnect(&previous, conn.id).await;
            }
        }
        conn.peer_id = Some(id.clone());
        let handle = PeerHandle::new(conn.id, conn.tx.clone(), conn.close.clone());
        relay.register(&id, handle).await;
        return;
    }

    let Some(peer_id) = conn.peer_id.clone() else {
        warn!(connection_id = %conn.id, "message before register; dropped");
        return;
    };
    debug!(peer = %peer_id, ?message, "control message");

    match message {
        ClientMessage::Register { .. } => {}
        ClientMessage::GetController => {
            let controller_id = relay.active_controller().await;
            let _ = conn.tx.send(ServerMessage::ControllerInfo { controller_id });
        }
        ClientMessage::Heartbeat => {}
        ClientMessage::Offer { target, data } => {
            relay
                .route(SignalKind::Offer, target.as_deref(), data, &peer_id)
                .await;
        }
        ClientMessage::Answer { target, data } => {
            relay
                .route(SignalKind::Answer, target.as_deref(), data, &peer_id)
                .await;
        }
        ClientMessage::IceCandidate { target, data } => {
            relay
                .route(SignalKind::IceCandidate, target.as_deref(), data, &peer_id)
                .await;
        }
        ClientMessage::ControllerKicked {
            target,
            new_controller_id,
        } => {
            let data = serde_json::json!({ "newControllerId": new_controller_id });
            relay
                .route(SignalKind::ControllerKicked, target.as_deref(), data, &peer_id)
                .await;
        }
        ClientMessage::ConnectedPeers { peers } => relay.record_reported_peers(&peer_id, peers),
    }
}
