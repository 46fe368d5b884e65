use metrics::counter;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::lock::{Acquired, ControllerLock, LockError, Released, Releaser};
use crate::queue::OfflineQueue;
use crate::registry::{ConnectionRegistry, PeerHandle};
use crate::signaling::{is_controller_id, ServerMessage, SignalKind};
use crate::storage::SharedStore;

pub type SharedRelay = Arc<Relay>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded,
    Queued,
    Dropped,
}

/// Routes control-plane messages between named peers without looking inside payloads.
pub struct Relay {
    registry: ConnectionRegistry,
    queue: OfflineQueue,
    lock: ControllerLock,
    store: SharedStore,
    controller_prefix: String,
}

impl Relay {
    pub fn new(store: SharedStore, config: &Config) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            queue: OfflineQueue::new(store.clone(), config.queue_ttl()),
            lock: ControllerLock::new(store.clone()),
            store,
            controller_prefix: config.controller_prefix.clone(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn is_controller(&self, peer_id: &str) -> bool {
        is_controller_id(peer_id, &self.controller_prefix)
    }

    /// Bind the socket, claim the lock for controller ids, then flush the peer's queue.
    /// Returns how many queued messages were delivered.
    pub async fn register(&self, peer_id: &str, handle: PeerHandle) -> usize {
        if let Some(displaced) = self.registry.bind(peer_id, handle) {
            info!(peer = %peer_id, old_connection = %displaced.connection_id, "peer re-registered; closing previous socket");
            displaced.close();
        }
        info!(peer = %peer_id, "peer registered");

        if self.is_controller(peer_id) {
            match self.lock.acquire(peer_id, false).await {
                Ok(outcome) => debug!(controller = %peer_id, ?outcome, "controller registration acquired lock"),
                Err(LockError::Conflict { owner }) => {
                    info!(controller = %peer_id, %owner, "controller registered while another holds the lock");
                    self.registry.send(
                        peer_id,
                        ServerMessage::ControllerInfo {
                            controller_id: Some(owner),
                        },
                    );
                }
                Err(err) => warn!(controller = %peer_id, error = %err, "controller lock unavailable at registration"),
            }
        }

        match self
            .queue
            .drain(peer_id, |message| self.registry.send(peer_id, message))
            .await
        {
            Ok(delivered) => {
                if delivered > 0 {
                    info!(peer = %peer_id, delivered, "delivered queued messages");
                }
                delivered
            }
            Err(err) => {
                error!(peer = %peer_id, error = %err, "failed to drain offline queue");
                0
            }
        }
    }

    /// Forward to a live socket, or queue for later when the target is offline.
    pub async fn route(
        &self,
        kind: SignalKind,
        target: Option<&str>,
        data: serde_json::Value,
        source: &str,
    ) -> RouteOutcome {
        let Some(target) = target.filter(|t| !t.trim().is_empty()) else {
            warn!(%source, kind = kind.as_str(), "dropping message without target");
            counter!("synth_relay_messages_dropped_total", 1, "reason" => "missing_target");
            return RouteOutcome::Dropped;
        };
        self.deliver(target, ServerMessage::routed(kind, source, data))
            .await
    }

    pub async fn deliver(&self, target: &str, message: ServerMessage) -> RouteOutcome {
        let kind = message.kind();
        if self.registry.send(target, message.clone()) {
            debug!(%target, kind, "forwarded message");
            counter!("synth_relay_messages_forwarded_total", 1, "kind" => kind);
            return RouteOutcome::Forwarded;
        }
        match self.queue.enqueue(target, message).await {
            Ok(_) => RouteOutcome::Queued,
            Err(err) => {
                error!(%target, kind, error = %err, "queue unavailable; message dropped");
                counter!("synth_relay_messages_dropped_total", 1, "reason" => "store_unavailable");
                RouteOutcome::Dropped
            }
        }
    }

    /// Current controller, or `None` when the store cannot be read.
    pub async fn active_controller(&self) -> Option<String> {
        match self.lock.current().await {
            Ok(controller) => controller,
            Err(err) => {
                warn!(error = %err, "store unavailable; reporting no active controller");
                None
            }
        }
    }

    pub async fn lock_status(&self) -> Result<Option<String>, LockError> {
        self.lock.current().await
    }

    /// Socket closed: drop the binding and release the lock if this peer held it.
    pub async fn disconnect(&self, peer_id: &str, connection_id: Uuid) {
        if !self.registry.unbind(peer_id, connection_id) {
            return;
        }
        info!(peer = %peer_id, "peer disconnected");
        match self.lock.release(&Releaser::Owner(peer_id.to_string())).await {
            Ok(Released::Released { .. }) => {
                info!(controller = %peer_id, "released lock of disconnected controller")
            }
            Ok(Released::NotHeld) | Err(LockError::NotOwner { .. }) => {}
            Err(err) => {
                warn!(peer = %peer_id, error = %err, "failed to release lock on disconnect")
            }
        }
    }

    /// Acquire the lock; a forced takeover notifies the deposed controller.
    pub async fn acquire_controller(&self, owner: &str, force: bool) -> Result<Acquired, LockError> {
        let acquired = self.lock.acquire(owner, force).await?;
        if let Acquired::TookOver { previous } = &acquired {
            counter!("synth_relay_controller_takeovers_total", 1);
            self.kick(previous, owner).await;
        }
        Ok(acquired)
    }

    /// Release the lock. A forced release naming a successor also notifies the deposed owner.
    pub async fn release_controller(
        &self,
        releaser: &Releaser,
        successor: Option<&str>,
    ) -> Result<Released, LockError> {
        let released = self.lock.release(releaser).await?;
        if let (Releaser::Force, Released::Released { previous }, Some(next)) =
            (releaser, &released, successor)
        {
            if previous != next {
                counter!("synth_relay_controller_takeovers_total", 1);
                self.kick(previous, next).await;
            }
        }
        Ok(released)
    }

    async fn kick(&self, deposed: &str, new_controller: &str) {
        let outcome = self
            .deliver(
                deposed,
                ServerMessage::ControllerKicked {
                    new_controller_id: new_controller.to_string(),
                    source: new_controller.to_string(),
                },
            )
            .await;
        info!(%deposed, %new_controller, ?outcome, "sent controller-kicked");
    }

    pub fn record_reported_peers(&self, peer_id: &str, peers: Vec<String>) {
        debug!(peer = %peer_id, live = peers.len(), "controller reported live peers");
        self.registry.record_reported_peers(peer_id, peers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    fn relay() -> Relay {
        Relay::new(Arc::new(MemoryStore::new()), &Config::default())
    }

    fn socket() -> (PeerHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerHandle::new(Uuid::new_v4(), tx, Arc::new(Notify::new())), rx)
    }

    #[tokio::test]
    async fn live_target_receives_offer_directly() {
        let relay = relay();
        let (controller, mut controller_rx) = socket();
        relay.register("controller-abc", controller).await;
        let (synth, _synth_rx) = socket();
        relay.register("synth-1", synth).await;

        assert_eq!(relay.active_controller().await.as_deref(), Some("controller-abc"));

        let outcome = relay
            .route(
                SignalKind::Offer,
                Some("controller-abc"),
                serde_json::json!({"sdp": "offer"}),
                "synth-1",
            )
            .await;
        assert_eq!(outcome, RouteOutcome::Forwarded);
        assert_eq!(
            controller_rx.try_recv().unwrap(),
            ServerMessage::Offer {
                source: "synth-1".into(),
                data: serde_json::json!({"sdp": "offer"}),
            }
        );
    }

    #[tokio::test]
    async fn offline_target_gets_queued_message_on_register() {
        let relay = relay();
        let outcome = relay
            .route(
                SignalKind::Answer,
                Some("synth-9"),
                serde_json::json!({"sdp": "answer"}),
                "controller-abc",
            )
            .await;
        assert_eq!(outcome, RouteOutcome::Queued);

        let (synth, mut synth_rx) = socket();
        assert_eq!(relay.register("synth-9", synth).await, 1);
        assert!(matches!(
            synth_rx.try_recv().unwrap(),
            ServerMessage::Answer { source, .. } if source == "controller-abc"
        ));
        assert!(synth_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_message_expires_after_ttl() {
        let relay = relay();
        relay
            .route(
                SignalKind::Offer,
                Some("controller-xyz"),
                serde_json::json!({}),
                "synth-1",
            )
            .await;
        tokio::time::advance(Duration::from_secs(5 * 60)).await;

        let (controller, mut controller_rx) = socket();
        assert_eq!(relay.register("controller-xyz", controller).await, 0);
        assert!(controller_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_target_is_dropped() {
        let relay = relay();
        let outcome = relay
            .route(SignalKind::IceCandidate, None, serde_json::json!({}), "synth-1")
            .await;
        assert_eq!(outcome, RouteOutcome::Dropped);
    }

    #[tokio::test]
    async fn second_controller_is_told_current_owner() {
        let relay = relay();
        let (first, _first_rx) = socket();
        relay.register("controller-a", first).await;
        let (second, mut second_rx) = socket();
        relay.register("controller-b", second).await;

        assert_eq!(
            second_rx.try_recv().unwrap(),
            ServerMessage::ControllerInfo {
                controller_id: Some("controller-a".into())
            }
        );
        assert_eq!(relay.active_controller().await.as_deref(), Some("controller-a"));
    }

    #[tokio::test]
    async fn forced_takeover_kicks_previous_controller() {
        let relay = relay();
        let (first, mut first_rx) = socket();
        relay.register("controller-a", first).await;

        let acquired = relay.acquire_controller("controller-b", true).await.unwrap();
        assert!(acquired.is_takeover());
        assert_eq!(
            first_rx.try_recv().unwrap(),
            ServerMessage::ControllerKicked {
                new_controller_id: "controller-b".into(),
                source: "controller-b".into(),
            }
        );
        assert_eq!(relay.active_controller().await.as_deref(), Some("controller-b"));
    }

    #[tokio::test]
    async fn kick_for_offline_controller_is_queued() {
        let relay = relay();
        let (first, first_rx) = socket();
        let first_id = first.connection_id;
        relay.register("controller-a", first).await;
        drop(first_rx);
        relay.registry().unbind("controller-a", first_id);

        relay
            .release_controller(&Releaser::Force, Some("controller-b"))
            .await
            .unwrap();

        let (again, mut again_rx) = socket();
        relay.register("controller-a", again).await;
        assert!(matches!(
            again_rx.try_recv().unwrap(),
            ServerMessage::ControllerKicked { new_controller_id, .. } if new_controller_id == "controller-b"
        ));
    }

    #[tokio::test]
    async fn disconnect_releases_only_own_lock() {
        let relay = relay();
        let (controller, _rx) = socket();
        let connection_id = controller.connection_id;
        relay.register("controller-a", controller).await;
        let (synth, _synth_rx) = socket();
        let synth_connection = synth.connection_id;
        relay.register("synth-1", synth).await;

        relay.disconnect("synth-1", synth_connection).await;
        assert_eq!(relay.active_controller().await.as_deref(), Some("controller-a"));

        relay.disconnect("controller-a", connection_id).await;
        assert_eq!(relay.active_controller().await, None);
    }

    #[tokio::test]
    async fn displaced_socket_close_keeps_lock() {
        let relay = relay();
        let (old, _old_rx) = socket();
        let old_connection = old.connection_id;
        relay.register("controller-a", old).await;
        let (new, _new_rx) = socket();
        relay.register("controller-a", new).await;

        relay.disconnect("controller-a", old_connection).await;
        assert!(relay.registry().contains("controller-a"));
        assert_eq!(relay.active_controller().await.as_deref(), Some("controller-a"));
    }
}
