use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{PeerError, Result};

/// Events a data channel delivers to its session driver, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// Outbound half of a peer-to-peer data channel. Inbound traffic arrives separately as a
/// stream of [`ChannelEvent`]s.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub type SharedChannel = Arc<dyn DataChannel>;

/// In-process channel pair for tests and local loopback.
pub struct MemoryChannel {
    remote: mpsc::UnboundedSender<ChannelEvent>,
    local: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Two connected ends, each with the event stream it observes. Both streams start with
    /// `Open`.
    #[allow(clippy::type_complexity)]
    pub fn pair() -> (
        (MemoryChannel, mpsc::UnboundedReceiver<ChannelEvent>),
        (MemoryChannel, mpsc::UnboundedReceiver<ChannelEvent>),
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let _ = a_tx.send(ChannelEvent::Open);
        let _ = b_tx.send(ChannelEvent::Open);
        let a = MemoryChannel {
            remote: b_tx.clone(),
            local: a_tx.clone(),
            closed: closed.clone(),
        };
        let b = MemoryChannel {
            remote: a_tx,
            local: b_tx,
            closed,
        };
        ((a, a_rx), (b, b_rx))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(PeerError::ChannelClosed);
        }
        self.remote
            .send(ChannelEvent::Message(text))
            .map_err(|_| PeerError::ChannelClosed)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.local.send(ChannelEvent::Closed);
            let _ = self.remote.send(ChannelEvent::Closed);
        }
        Ok(())
    }
}
