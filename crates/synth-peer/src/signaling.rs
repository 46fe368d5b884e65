use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{PeerError, Result};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(20);

/// Messages sent from a peer to the relay over the control socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Register {
        id: String,
    },
    GetController,
    Heartbeat,
    Offer {
        target: String,
        data: serde_json::Value,
    },
    Answer {
        target: String,
        data: serde_json::Value,
    },
    IceCandidate {
        target: String,
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ControllerKicked {
        target: String,
        new_controller_id: String,
    },
    ConnectedPeers {
        peers: Vec<String>,
    },
}

/// Messages sent from the relay to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ControllerInfo {
        controller_id: Option<String>,
    },
    Offer {
        source: String,
        data: serde_json::Value,
    },
    Answer {
        source: String,
        data: serde_json::Value,
    },
    IceCandidate {
        source: String,
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ControllerKicked {
        new_controller_id: String,
        source: String,
    },
}

/// Outbound side of the control socket, as seen by session drivers.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<()>;
}

#[async_trait]
impl ControlPlane for mpsc::UnboundedSender<ClientMessage> {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| PeerError::RelayClosed)
    }
}

/// Control-socket connection to the relay
pub struct RelayClient {
    peer_id: String,
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<ServerMessage>>,
    socket_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl RelayClient {
    pub async fn connect(relay_url: &str, peer_id: &str) -> Result<Self> {
        Self::connect_with_heartbeat(relay_url, peer_id, DEFAULT_HEARTBEAT).await
    }

    pub async fn connect_with_heartbeat(
        relay_url: &str,
        peer_id: &str,
        heartbeat: Duration,
    ) -> Result<Self> {
        let ws_url = ws_url(relay_url);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| PeerError::Relay(e.to_string()))?;
        debug!(%ws_url, peer = %peer_id, "connected to relay");

        let (tx_client, rx_client) = mpsc::unbounded_channel::<ClientMessage>();
        let (tx_server, rx_server) = mpsc::unbounded_channel::<ServerMessage>();

        tx_client
            .send(ClientMessage::Register {
                id: peer_id.to_string(),
            })
            .map_err(|_| PeerError::RelayClosed)?;

        let socket_task = tokio::spawn(bridge_socket(ws_stream, rx_client, tx_server));

        let tx_heartbeat = tx_client.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx_heartbeat.send(ClientMessage::Heartbeat).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            peer_id: peer_id.to_string(),
            tx: tx_client,
            rx: Mutex::new(rx_server),
            socket_task,
            heartbeat_task,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Sender usable as a [`ControlPlane`] by session drivers.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.tx.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| PeerError::RelayClosed)
    }

    /// Next message from the relay; `None` once the socket has closed.
    pub async fn recv(&self) -> Option<ServerMessage> {
        self.rx.lock().await.recv().await
    }

    /// Stop the heartbeat and drop the socket.
    pub fn close(self) {
        debug!(peer = %self.peer_id, "closing relay connection");
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.heartbeat_task.abort();
        self.socket_task.abort();
    }
}

fn ws_url(relay_url: &str) -> String {
    let base = relay_url.trim_end_matches('/');
    let base = if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if base.contains("localhost") || base.contains("127.0.0.1") {
        format!("ws://{base}")
    } else {
        format!("wss://{base}")
    };
    if base.ends_with("/ws") {
        base
    } else {
        format!("{base}/ws")
    }
}

async fn bridge_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_client: mpsc::UnboundedReceiver<ClientMessage>,
    tx_server: mpsc::UnboundedSender<ServerMessage>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outbound = rx_client.recv() => {
                let Some(msg) = outbound else {
                    let _ = ws_sender.close().await;
                    break;
                };
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode control message"),
                }
            }
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(server_msg) => {
                            if tx_server.send(server_msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping unrecognized relay message"),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("relay socket closed");
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub active: bool,
    pub is_current_client: bool,
    pub controller_client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcquireBody {
    takeover: bool,
}

#[derive(Debug, Deserialize)]
struct ReleaseBody {
    released: bool,
}

/// HTTP client for the relay's `/controller/active` endpoints.
#[derive(Clone)]
pub struct LockClient {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
}

impl LockClient {
    pub fn new(base_url: &str, client_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/controller/active", base_url.trim_end_matches('/')),
            client_id: client_id.to_string(),
        }
    }

    /// Returns whether the call took the lock over from another controller.
    pub async fn acquire(&self, force: bool) -> Result<bool> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "controllerClientId": self.client_id, "force": force }))
            .send()
            .await?;
        let body: AcquireBody = Self::check(response).await?.json().await?;
        Ok(body.takeover)
    }

    /// Voluntary release. `Ok(false)` when the lock was already free.
    pub async fn release(&self) -> Result<bool> {
        self.delete(json!({ "controllerClientId": self.client_id }))
            .await
    }

    /// Force-release the lock on behalf of `new_controller_id`; the deposed owner is told.
    pub async fn force_takeover(&self, new_controller_id: &str) -> Result<bool> {
        self.delete(json!({
            "controllerClientId": "force-deactivate",
            "newControllerClientId": new_controller_id,
        }))
        .await
    }

    pub async fn status(&self) -> Result<LockStatus> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("clientId", self.client_id.as_str())])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn delete(&self, body: serde_json::Value) -> Result<bool> {
        let response = self.http.delete(&self.endpoint).json(&body).send().await?;
        let body: ReleaseBody = Self::check(response).await?.json().await?;
        Ok(body.released)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let reason = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| status.to_string());
        Err(PeerError::LockRejected {
            status: status.as_u16(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_messages_match_wire_format() {
        let kicked = ClientMessage::ControllerKicked {
            target: "controller-a".into(),
            new_controller_id: "controller-b".into(),
        };
        assert_eq!(
            serde_json::to_value(&kicked).unwrap(),
            json!({"type": "controller-kicked", "target": "controller-a", "newControllerId": "controller-b"})
        );

        let info: ServerMessage =
            serde_json::from_str(r#"{"type":"controller-info","controllerId":null}"#).unwrap();
        assert_eq!(info, ServerMessage::ControllerInfo { controller_id: None });
    }

    #[test]
    fn ws_url_normalisation() {
        assert_eq!(ws_url("http://127.0.0.1:8080"), "ws://127.0.0.1:8080/ws");
        assert_eq!(ws_url("wss://relay.example/ws"), "wss://relay.example/ws");
        assert_eq!(ws_url("relay.example/"), "wss://relay.example/ws");
        assert_eq!(ws_url("localhost:8080"), "ws://localhost:8080/ws");
    }

    #[tokio::test]
    async fn channel_sender_is_a_control_plane() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ControlPlane::send(&tx, ClientMessage::GetController)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(ClientMessage::GetController));
        drop(rx);
        assert!(matches!(
            ControlPlane::send(&tx, ClientMessage::Heartbeat).await,
            Err(PeerError::RelayClosed)
        ));
    }
}
