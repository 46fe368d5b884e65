use serde::{Deserialize, Serialize};

/// Handshake message kinds the relay forwards without inspecting the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    ControllerKicked,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::ControllerKicked => "controller-kicked",
        }
    }
}

/// Messages sent from a peer to the relay over the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Bind this socket to a peer id
    Register { id: String },
    /// Ask for the currently active controller
    GetController,
    /// Keep-alive; only refreshes the idle timer
    Heartbeat,
    Offer {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
    },
    Answer {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
    },
    IceCandidate {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ControllerKicked {
        #[serde(default)]
        target: Option<String>,
        new_controller_id: String,
    },
    /// Live data-channel peers as seen by a controller's liveness verifier
    ConnectedPeers { peers: Vec<String> },
}

/// Messages sent from the relay to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ControllerInfo { controller_id: Option<String> },
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

impl ServerMessage {
    /// Build the envelope delivered to the target of a routed handshake message.
    pub fn routed(kind: SignalKind, source: &str, data: serde_json::Value) -> Self {
        let source = source.to_string();
        match kind {
            SignalKind::Offer => ServerMessage::Offer { source, data },
            SignalKind::Answer => ServerMessage::Answer { source, data },
            SignalKind::IceCandidate => ServerMessage::IceCandidate { source, data },
            SignalKind::ControllerKicked => ServerMessage::ControllerKicked {
                new_controller_id: data
                    .get("newControllerId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                source,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ControllerInfo { .. } => "controller-info",
            ServerMessage::Offer { .. } => SignalKind::Offer.as_str(),
            ServerMessage::Answer { .. } => SignalKind::Answer.as_str(),
            ServerMessage::IceCandidate { .. } => SignalKind::IceCandidate.as_str(),
            ServerMessage::ControllerKicked { .. } => SignalKind::ControllerKicked.as_str(),
        }
    }
}

/// Controller role is inferred from the id prefix. This is a routing hint only and is
/// never used to authorize anything beyond the lock's own ownership checks.
pub fn is_controller_id(peer_id: &str, prefix: &str) -> bool {
    !prefix.is_empty() && peer_id.starts_with(prefix)
}
