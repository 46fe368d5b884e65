use dashmap::DashMap;
use metrics::gauge;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::signaling::ServerMessage;

/// Instance-local binding of a peer id to one live control socket.
#[derive(Clone)]
pub struct PeerHandle {
    pub connection_id: Uuid,
    tx: mpsc::UnboundedSender<ServerMessage>,
    close: Arc<Notify>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub reported_peers: Vec<String>,
}

impl PeerHandle {
    pub fn new(
        connection_id: Uuid,
        tx: mpsc::UnboundedSender<ServerMessage>,
        close: Arc<Notify>,
    ) -> Self {
        Self {
            connection_id,
            tx,
            close,
            connected_at: chrono::Utc::now(),
            reported_peers: Vec::new(),
        }
    }

    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Ask the owning socket task to shut down.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

/// Registry of the control sockets connected to this relay instance. Only used for direct
/// delivery; anything that must be consistent across instances lives in the store.
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: DashMap<String, PeerHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `peer_id` to a socket, replacing any previous binding (last writer wins).
    /// Returns the displaced handle when it belonged to another connection.
    pub fn bind(&self, peer_id: &str, handle: PeerHandle) -> Option<PeerHandle> {
        let connection_id = handle.connection_id;
        let previous = self.peers.insert(peer_id.to_string(), handle);
        gauge!("synth_relay_connections", self.peers.len() as f64);
        previous.filter(|prev| prev.connection_id != connection_id)
    }

    /// Remove the binding only if it still belongs to `connection_id`.
    pub fn unbind(&self, peer_id: &str, connection_id: Uuid) -> bool {
        let removed = self
            .peers
            .remove_if(peer_id, |_, handle| handle.connection_id == connection_id)
            .is_some();
        if removed {
            gauge!("synth_relay_connections", self.peers.len() as f64);
        } else {
            debug!(peer = %peer_id, %connection_id, "binding already replaced; nothing to unbind");
        }
        removed
    }

    /// Direct delivery to a live socket. `false` when the peer is not bound here or its
    /// socket task has gone away.
    pub fn send(&self, peer_id: &str, message: ServerMessage) -> bool {
        // Clone the handle out so no map guard is held while sending.
        let handle = self.peers.get(peer_id).map(|entry| entry.value().clone());
        match handle {
            Some(handle) => handle.send(message),
            None => false,
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn is_bound_to(&self, peer_id: &str, connection_id: Uuid) -> bool {
        self.peers
            .get(peer_id)
            .map(|entry| entry.connection_id == connection_id)
            .unwrap_or(false)
    }

    pub fn record_reported_peers(&self, peer_id: &str, peers: Vec<String>) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut entry) => {
                entry.reported_peers = peers;
                true
            }
            None => false,
        }
    }

    pub fn reported_peers(&self, peer_id: &str) -> Option<Vec<String>> {
        self.peers
            .get(peer_id)
            .map(|entry| entry.reported_peers.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
