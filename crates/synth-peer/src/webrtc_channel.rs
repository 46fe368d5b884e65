use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::channel::{ChannelEvent, DataChannel};
use crate::error::{PeerError, Result};

/// [`DataChannel`] over a webrtc-rs data channel.
pub struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send_text(&self, text: String) -> Result<()> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| PeerError::Channel(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| PeerError::Channel(e.to_string()))
    }
}

/// Hook the channel's callbacks and return it with the event stream they feed.
pub fn attach(
    data_channel: Arc<RTCDataChannel>,
) -> (WebRtcChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let label = data_channel.label().to_string();

    let tx_open = tx.clone();
    let label_open = label.clone();
    data_channel.on_open(Box::new(move || {
        let tx = tx_open.clone();
        let label = label_open.clone();
        Box::pin(async move {
            debug!(%label, "data channel opened");
            let _ = tx.send(ChannelEvent::Open);
        })
    }));

    let tx_close = tx.clone();
    let label_close = label.clone();
    data_channel.on_close(Box::new(move || {
        let tx = tx_close.clone();
        let label = label_close.clone();
        Box::pin(async move {
            debug!(%label, "data channel closed");
            let _ = tx.send(ChannelEvent::Closed);
        })
    }));

    data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        let label = label.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(ChannelEvent::Message(text));
                }
                Err(_) => warn!(%label, bytes = msg.data.len(), "dropping non-UTF8 data channel frame"),
            }
        })
    }));

    (WebRtcChannel { inner: data_channel }, rx)
}
