use metrics::counter;
use std::time::Duration;
use tracing::{debug, warn};

use crate::signaling::ServerMessage;
use crate::storage::{QueuedMessage, SharedStore, StoreError};

/// Store-and-forward for handshake messages whose recipient has no live socket.
/// Delivery is at most once and bounded by the TTL; late registrations lose messages.
#[derive(Clone)]
pub struct OfflineQueue {
    store: SharedStore,
    ttl: Duration,
}

impl OfflineQueue {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn enqueue(
        &self,
        recipient: &str,
        payload: ServerMessage,
    ) -> Result<QueuedMessage, StoreError> {
        let message = QueuedMessage::new(recipient, payload);
        self.store.push_message(&message, self.ttl).await?;
        counter!("synth_relay_messages_queued_total", 1, "kind" => message.payload.kind());
        debug!(
            %recipient,
            message_id = %message.message_id,
            kind = message.payload.kind(),
            "queued message for offline peer"
        );
        Ok(message)
    }

    /// Deliver every unexpired message for `recipient` through `deliver`, in enqueue order.
    /// Each entry is claimed before the send attempt, so a failed send is never retried.
    pub async fn drain<F>(&self, recipient: &str, mut deliver: F) -> Result<usize, StoreError>
    where
        F: FnMut(ServerMessage) -> bool,
    {
        let pending = self.store.pending_messages(recipient).await?;
        let mut delivered = 0;
        for message in pending {
            if !self
                .store
                .claim_message(recipient, &message.message_id)
                .await?
            {
                debug!(%recipient, message_id = %message.message_id, "queued message already claimed elsewhere");
                continue;
            }
            let kind = message.payload.kind();
            if deliver(message.payload) {
                delivered += 1;
                counter!("synth_relay_messages_drained_total", 1, "kind" => kind);
            } else {
                warn!(%recipient, message_id = %message.message_id, kind, "queued message send failed; dropped");
                counter!("synth_relay_messages_dropped_total", 1, "reason" => "drain_send_failed");
            }
        }
        Ok(delivered)
    }
}
